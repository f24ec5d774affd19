//! qBittorrent Web API adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::metainfo::InfoHash;

use super::{AddTorrent, ClientError, ClientTorrentInfo, ClientUrl, TorrentClient, TorrentState};

/// qBittorrent client speaking the v2 Web API.
pub struct QbittorrentClient {
    client: Client,
    url: ClientUrl,
    /// Marker for an authenticated session; the cookie jar holds the SID.
    session: Arc<RwLock<bool>>,
}

#[derive(Debug, Deserialize)]
struct QbTorrent {
    hash: String,
    name: String,
    save_path: String,
    state: String,
    progress: f64,
    size: u64,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QbTracker {
    url: String,
}

impl QbittorrentClient {
    pub fn new(url: ClientUrl, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .cookie_store(true)
            .build()
            .expect("reqwest client construction");
        Self {
            client,
            url,
            session: Arc::new(RwLock::new(false)),
        }
    }

    async fn login(&self) -> Result<(), ClientError> {
        let endpoint = format!("{}/api/v2/auth/login", self.url.base_url);
        let params = [
            ("username", self.url.username.as_str()),
            ("password", self.url.password.as_str()),
        ];
        let response = self
            .client
            .post(&endpoint)
            .form(&params)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if body.contains("Ok.") {
            debug!("qBittorrent login successful");
            *self.session.write().await = true;
            Ok(())
        } else if body.contains("Fails.") || status.as_u16() == 403 {
            Err(ClientError::AuthenticationFailed(
                "invalid credentials".to_string(),
            ))
        } else {
            Err(ClientError::AuthenticationFailed(format!(
                "unexpected response: {}",
                body.chars().take(100).collect::<String>()
            )))
        }
    }

    async fn ensure_authenticated(&self) -> Result<(), ClientError> {
        if *self.session.read().await {
            return Ok(());
        }
        self.login().await
    }

    /// GET with one re-login retry on an expired session.
    async fn get(&self, endpoint: &str) -> Result<String, ClientError> {
        self.ensure_authenticated().await?;
        let full = format!("{}{}", self.url.base_url, endpoint);
        let response = self.client.get(&full).send().await.map_err(map_reqwest)?;
        if response.status().as_u16() == 403 {
            warn!("qBittorrent session expired, re-authenticating");
            *self.session.write().await = false;
            self.login().await?;
            let retry = self.client.get(&full).send().await.map_err(map_reqwest)?;
            if !retry.status().is_success() {
                return Err(ClientError::ApiError(format!("HTTP {}", retry.status())));
            }
            return retry.text().await.map_err(map_reqwest);
        }
        if !response.status().is_success() {
            return Err(ClientError::ApiError(format!("HTTP {}", response.status())));
        }
        response.text().await.map_err(map_reqwest)
    }

    async fn get_bytes(&self, endpoint: &str) -> Result<Vec<u8>, ClientError> {
        self.ensure_authenticated().await?;
        let full = format!("{}{}", self.url.base_url, endpoint);
        let response = self.client.get(&full).send().await.map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(ClientError::ApiError(format!("HTTP {}", response.status())));
        }
        Ok(response.bytes().await.map_err(map_reqwest)?.to_vec())
    }

    async fn post_form(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<(), ClientError> {
        self.ensure_authenticated().await?;
        let full = format!("{}{}", self.url.base_url, endpoint);
        let response = self
            .client
            .post(&full)
            .form(params)
            .send()
            .await
            .map_err(map_reqwest)?;
        if response.status().as_u16() == 403 {
            *self.session.write().await = false;
            self.login().await?;
            let retry = self
                .client
                .post(&full)
                .form(params)
                .send()
                .await
                .map_err(map_reqwest)?;
            if !retry.status().is_success() {
                return Err(ClientError::ApiError(format!("HTTP {}", retry.status())));
            }
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(ClientError::ApiError(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn torrent(&self, hash: &InfoHash) -> Result<QbTorrent, ClientError> {
        let body = self
            .get(&format!("/api/v2/torrents/info?hashes={hash}"))
            .await?;
        let mut list: Vec<QbTorrent> =
            serde_json::from_str(&body).map_err(|e| ClientError::ApiError(e.to_string()))?;
        list.pop()
            .ok_or_else(|| ClientError::TorrentNotFound(hash.to_string()))
    }

    fn map_state(state: &str) -> TorrentState {
        match state {
            "downloading" | "metaDL" | "forcedDL" | "stalledDL" => TorrentState::Downloading,
            "uploading" | "forcedUP" | "stalledUP" => TorrentState::Seeding,
            "pausedDL" | "pausedUP" | "stoppedDL" | "stoppedUP" => TorrentState::Paused,
            "checkingDL" | "checkingUP" | "checkingResumeData" => TorrentState::Checking,
            "queuedDL" | "queuedUP" | "allocating" => TorrentState::Queued,
            "error" | "missingFiles" => TorrentState::Error,
            _ => TorrentState::Unknown,
        }
    }
}

#[async_trait]
impl TorrentClient for QbittorrentClient {
    fn name(&self) -> &str {
        "qbittorrent"
    }

    async fn list_hashes(&self) -> Result<Vec<InfoHash>, ClientError> {
        let body = self.get("/api/v2/torrents/info").await?;
        let list: Vec<QbTorrent> =
            serde_json::from_str(&body).map_err(|e| ClientError::ApiError(e.to_string()))?;
        Ok(list
            .into_iter()
            .filter_map(|t| t.hash.parse().ok())
            .collect())
    }

    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo, ClientError> {
        let t = self.torrent(hash).await?;
        let trackers_body = self
            .get(&format!("/api/v2/torrents/trackers?hash={hash}"))
            .await?;
        let trackers: Vec<QbTracker> = serde_json::from_str(&trackers_body)
            .map_err(|e| ClientError::ApiError(e.to_string()))?;
        Ok(ClientTorrentInfo {
            hash: *hash,
            name: t.name,
            save_path: t.save_path,
            state: Self::map_state(&t.state),
            progress: t.progress,
            total_size: t.size,
            trackers: trackers
                .into_iter()
                .map(|t| t.url)
                .filter(|u| u.starts_with("http") || u.starts_with("udp"))
                .collect(),
            label: t.category.filter(|c| !c.is_empty()),
        })
    }

    async fn fetch_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>, ClientError> {
        // The export endpoint needs qBittorrent >= 4.5; fall back to the
        // BT_backup directory when configured.
        match self.get_bytes(&format!("/api/v2/torrents/export?hash={hash}")).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                if let Some(dir) = &self.url.torrents_dir {
                    let path = dir.join(format!("{hash}.torrent"));
                    tokio::fs::read(&path)
                        .await
                        .map_err(|e| ClientError::ApiError(e.to_string()))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn add_torrent(&self, req: AddTorrent) -> Result<(), ClientError> {
        self.ensure_authenticated().await?;
        let form = multipart::Form::new()
            .part(
                "torrents",
                multipart::Part::bytes(req.metainfo)
                    .file_name("inject.torrent")
                    .mime_str("application/x-bittorrent")
                    .map_err(|e| ClientError::ApiError(e.to_string()))?,
            )
            .text("savepath", req.save_path)
            .text("category", req.label)
            .text("paused", if req.paused { "true" } else { "false" })
            .text("stopped", if req.paused { "true" } else { "false" })
            .text("skip_checking", "false");

        let full = format!("{}/api/v2/torrents/add", self.url.base_url);
        let response = self
            .client
            .post(&full)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest)?;
        if !response.status().is_success() {
            return Err(ClientError::ApiError(format!("HTTP {}", response.status())));
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("Fails.") {
            return Err(ClientError::ApiError("torrent add rejected".to_string()));
        }
        Ok(())
    }

    async fn recheck(&self, hash: &InfoHash) -> Result<(), ClientError> {
        self.post_form("/api/v2/torrents/recheck", &[("hashes", &hash.to_string())])
            .await
    }

    async fn status(&self, hash: &InfoHash) -> Result<(TorrentState, f64), ClientError> {
        let t = self.torrent(hash).await?;
        Ok((Self::map_state(&t.state), t.progress))
    }

    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<(), ClientError> {
        self.post_form(
            "/api/v2/torrents/setCategory",
            &[("hashes", hash.to_string().as_str()), ("category", label)],
        )
        .await
    }
}

fn map_reqwest(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else if e.is_connect() {
        ClientError::ConnectionFailed(e.to_string())
    } else {
        ClientError::ApiError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_covers_checking_states() {
        assert_eq!(
            QbittorrentClient::map_state("checkingUP"),
            TorrentState::Checking
        );
        assert_eq!(
            QbittorrentClient::map_state("stalledUP"),
            TorrentState::Seeding
        );
        assert_eq!(
            QbittorrentClient::map_state("missingFiles"),
            TorrentState::Error
        );
        assert_eq!(
            QbittorrentClient::map_state("wat"),
            TorrentState::Unknown
        );
    }
}
