//! Transmission RPC adapter.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::metainfo::InfoHash;

use super::{AddTorrent, ClientError, ClientTorrentInfo, ClientUrl, TorrentClient, TorrentState};

const SESSION_HEADER: &str = "X-Transmission-Session-Id";

/// Transmission client speaking the JSON-RPC API.
pub struct TransmissionClient {
    client: Client,
    url: ClientUrl,
    session_id: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TrTorrent {
    #[serde(rename = "hashString")]
    hash_string: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "downloadDir")]
    download_dir: String,
    #[serde(default, rename = "percentDone")]
    percent_done: f64,
    #[serde(default)]
    status: i64,
    #[serde(default, rename = "totalSize")]
    total_size: u64,
    #[serde(default)]
    trackers: Vec<TrTracker>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TrTracker {
    announce: String,
}

impl TransmissionClient {
    pub fn new(url: ClientUrl, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client construction");
        Self {
            client,
            url,
            session_id: RwLock::new(None),
        }
    }

    /// Issue an RPC call, handling the 409 session-id handshake once.
    async fn rpc(&self, method: &str, arguments: Value) -> Result<Value, ClientError> {
        let body = json!({ "method": method, "arguments": arguments });

        for attempt in 0..2 {
            let mut request = self
                .client
                .post(&self.url.base_url)
                .basic_auth(&self.url.username, Some(&self.url.password))
                .json(&body);
            if let Some(sid) = self.session_id.read().await.as_deref() {
                request = request.header(SESSION_HEADER, sid);
            }
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout
                } else if e.is_connect() {
                    ClientError::ConnectionFailed(e.to_string())
                } else {
                    ClientError::ApiError(e.to_string())
                }
            })?;

            match response.status() {
                StatusCode::CONFLICT if attempt == 0 => {
                    let sid = response
                        .headers()
                        .get(SESSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from)
                        .ok_or_else(|| {
                            ClientError::ApiError("409 without session id".to_string())
                        })?;
                    debug!("transmission session id refreshed");
                    *self.session_id.write().await = Some(sid);
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(ClientError::AuthenticationFailed(
                        "invalid credentials".to_string(),
                    ))
                }
                status if !status.is_success() => {
                    return Err(ClientError::ApiError(format!("HTTP {status}")))
                }
                _ => {}
            }

            let envelope: Value = response
                .json()
                .await
                .map_err(|e| ClientError::ApiError(e.to_string()))?;
            let result = envelope
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("missing result");
            if result != "success" {
                return Err(ClientError::ApiError(result.to_string()));
            }
            return Ok(envelope.get("arguments").cloned().unwrap_or(Value::Null));
        }

        Err(ClientError::ApiError("session negotiation failed".to_string()))
    }

    async fn torrents(&self, ids: Option<&InfoHash>, fields: &[&str]) -> Result<Vec<TrTorrent>, ClientError> {
        let mut args = json!({ "fields": fields });
        if let Some(hash) = ids {
            args["ids"] = json!([hash.to_string()]);
        }
        let result = self.rpc("torrent-get", args).await?;
        let torrents = result
            .get("torrents")
            .cloned()
            .unwrap_or_else(|| json!([]));
        serde_json::from_value(torrents).map_err(|e| ClientError::ApiError(e.to_string()))
    }

    fn map_status(status: i64) -> TorrentState {
        match status {
            0 => TorrentState::Paused,
            1 | 3 => TorrentState::Queued,
            2 => TorrentState::Checking,
            4 => TorrentState::Downloading,
            5 => TorrentState::Queued,
            6 => TorrentState::Seeding,
            _ => TorrentState::Unknown,
        }
    }
}

#[async_trait]
impl TorrentClient for TransmissionClient {
    fn name(&self) -> &str {
        "transmission"
    }

    async fn list_hashes(&self) -> Result<Vec<InfoHash>, ClientError> {
        let torrents = self.torrents(None, &["hashString"]).await?;
        Ok(torrents
            .into_iter()
            .filter_map(|t| t.hash_string.parse().ok())
            .collect())
    }

    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo, ClientError> {
        let mut torrents = self
            .torrents(
                Some(hash),
                &[
                    "hashString",
                    "name",
                    "downloadDir",
                    "percentDone",
                    "status",
                    "totalSize",
                    "trackers",
                    "labels",
                ],
            )
            .await?;
        let t = torrents
            .pop()
            .ok_or_else(|| ClientError::TorrentNotFound(hash.to_string()))?;
        Ok(ClientTorrentInfo {
            hash: *hash,
            name: t.name,
            save_path: t.download_dir,
            state: Self::map_status(t.status),
            progress: t.percent_done,
            total_size: t.total_size,
            trackers: t.trackers.into_iter().map(|t| t.announce).collect(),
            label: t.labels.into_iter().next(),
        })
    }

    async fn fetch_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>, ClientError> {
        // Transmission has no torrent export RPC; read the resume dir.
        let dir = self.url.torrents_dir.as_ref().ok_or_else(|| {
            ClientError::Unsupported(
                "transmission needs ?torrents_dir=… on the client URL to read metainfo".to_string(),
            )
        })?;
        let path = dir.join(format!("{hash}.torrent"));
        tokio::fs::read(&path)
            .await
            .map_err(|e| ClientError::ApiError(format!("{}: {e}", path.display())))
    }

    async fn add_torrent(&self, req: AddTorrent) -> Result<(), ClientError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&req.metainfo);
        let result = self
            .rpc(
                "torrent-add",
                json!({
                    "metainfo": encoded,
                    "download-dir": req.save_path,
                    "paused": req.paused,
                }),
            )
            .await?;

        // Label the torrent we just added (or the duplicate we collided with).
        let added = result
            .get("torrent-added")
            .or_else(|| result.get("torrent-duplicate"));
        if let Some(id) = added.and_then(|t| t.get("id")).and_then(Value::as_i64) {
            self.rpc(
                "torrent-set",
                json!({ "ids": [id], "labels": [req.label] }),
            )
            .await?;
        }
        Ok(())
    }

    async fn recheck(&self, hash: &InfoHash) -> Result<(), ClientError> {
        self.rpc("torrent-verify", json!({ "ids": [hash.to_string()] }))
            .await
            .map(|_| ())
    }

    async fn status(&self, hash: &InfoHash) -> Result<(TorrentState, f64), ClientError> {
        let mut torrents = self
            .torrents(Some(hash), &["hashString", "percentDone", "status"])
            .await?;
        let t = torrents
            .pop()
            .ok_or_else(|| ClientError::TorrentNotFound(hash.to_string()))?;
        Ok((Self::map_status(t.status), t.percent_done))
    }

    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<(), ClientError> {
        self.rpc(
            "torrent-set",
            json!({ "ids": [hash.to_string()], "labels": [label] }),
        )
        .await
        .map(|_| ())
    }
}
