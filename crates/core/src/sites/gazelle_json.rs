//! Gazelle JSON API adapter (`ajax.php`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::metainfo::InfoHash;

use super::{parse_gazelle_file_list, RemoteTorrent, SiteError, SiteLimiter, TrackerSite};

/// Sub-attempts per request for transient failures.
const MAX_ATTEMPTS: u32 = 3;
/// Rate-limit sleeps honored per request before giving up.
const MAX_RATE_LIMIT_WAITS: u32 = 3;

/// API-key authenticated Gazelle site.
pub struct GazelleJson {
    client: Client,
    server: String,
    site_id: String,
    tracker_domain: String,
    source_flag: String,
    limiter: SiteLimiter,
}

impl GazelleJson {
    pub fn new(
        server: &str,
        api_key: &str,
        tracker_domain: &str,
        source_flag: &str,
        max_concurrent: usize,
        requests_per_minute: u32,
        timeout_secs: u64,
    ) -> Result<Self, SiteError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(api_key)
                .map_err(|_| SiteError::Auth("API key is not a valid header value".into()))?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .user_agent(concat!("nemorosa/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SiteError::Network(e.to_string()))?;

        let server = server.trim_end_matches('/').to_string();
        let site_id = url::Url::parse(&server)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| server.clone());

        Ok(Self {
            client,
            server,
            site_id,
            tracker_domain: tracker_domain.to_string(),
            source_flag: source_flag.to_string(),
            limiter: SiteLimiter::new(max_concurrent, requests_per_minute),
        })
    }

    /// Issue an `ajax.php` request. `Ok(None)` means the site answered with
    /// a failure envelope (e.g. nothing found for a hash lookup).
    async fn request(
        &self,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<Option<Value>, SiteError> {
        let url = format!("{}/ajax.php", self.server);
        let mut rate_limit_waits = 0u32;
        let mut attempt = 0u32;

        loop {
            let _permit = self.limiter.acquire().await;
            let mut query = vec![("action", action)];
            query.extend_from_slice(params);

            let result = self.client.get(&url).query(&query).send().await;
            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    let err = if e.is_timeout() {
                        SiteError::Timeout
                    } else {
                        SiteError::Network(e.to_string())
                    };
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    debug!("{}: retrying {} after {}", self.site_id, action, err);
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    continue;
                }
            };

            match response.status() {
                StatusCode::TOO_MANY_REQUESTS => {
                    // Honored without consuming the retry budget.
                    rate_limit_waits += 1;
                    let wait = response
                        .headers()
                        .get(header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(10);
                    if rate_limit_waits > MAX_RATE_LIMIT_WAITS {
                        return Err(SiteError::RateLimited {
                            retry_after_ms: wait * 1000,
                        });
                    }
                    warn!("{}: rate limited, sleeping {}s", self.site_id, wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(SiteError::Auth(format!("HTTP {}", response.status())));
                }
                status if !status.is_success() => {
                    return Err(SiteError::Api(format!("HTTP {status}")));
                }
                _ => {}
            }

            let envelope: Value = response
                .json()
                .await
                .map_err(|e| SiteError::Parse(e.to_string()))?;
            return match envelope.get("status").and_then(Value::as_str) {
                Some("success") => Ok(envelope.get("response").cloned()),
                _ => Ok(None),
            };
        }
    }
}

/// Torrent sizes are bytes, but forks have emitted them as floats or
/// strings on older API versions; accept every numeric shape.
fn json_size(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[async_trait]
impl TrackerSite for GazelleJson {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    fn tracker_domain(&self) -> &str {
        &self.tracker_domain
    }

    fn source_flag(&self) -> &str {
        &self.source_flag
    }

    async fn search_by_hash(&self, hash: &InfoHash) -> Result<Option<RemoteTorrent>, SiteError> {
        let hex = hash.to_string().to_uppercase();
        let Some(response) = self.request("torrent", &[("hash", hex.as_str())]).await? else {
            return Ok(None);
        };
        let torrent = response.get("torrent");
        let Some(id) = torrent.and_then(|t| t.get("id")).and_then(Value::as_i64) else {
            return Ok(None);
        };
        Ok(Some(RemoteTorrent {
            remote_id: id,
            title: response
                .pointer("/group/name")
                .and_then(Value::as_str)
                .map(String::from),
            size: torrent.and_then(|t| t.get("size")).and_then(json_size),
        }))
    }

    async fn search_by_filename(&self, query: &str) -> Result<Vec<RemoteTorrent>, SiteError> {
        let Some(response) = self.request("browse", &[("filelist", query)]).await? else {
            return Ok(Vec::new());
        };
        let Some(results) = response.get("results").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        let mut torrents = Vec::new();
        for group in results {
            let title = group
                .get("groupName")
                .and_then(Value::as_str)
                .map(String::from);
            match group.get("torrents").and_then(Value::as_array) {
                Some(nested) => {
                    for t in nested {
                        if let Some(id) = t.get("torrentId").and_then(Value::as_i64) {
                            torrents.push(RemoteTorrent {
                                remote_id: id,
                                title: title.clone(),
                                size: t.get("size").and_then(json_size),
                            });
                        }
                    }
                }
                None => {
                    // Some Gazelle forks return flat, ungrouped results.
                    if let Some(id) = group.get("torrentId").and_then(Value::as_i64) {
                        torrents.push(RemoteTorrent {
                            remote_id: id,
                            title,
                            size: group.get("size").and_then(json_size),
                        });
                    }
                }
            }
        }
        Ok(torrents)
    }

    async fn fetch_file_list(&self, remote_id: i64) -> Result<HashMap<String, u64>, SiteError> {
        let id = remote_id.to_string();
        let Some(response) = self.request("torrent", &[("id", id.as_str())]).await? else {
            return Ok(HashMap::new());
        };
        let raw = response
            .pointer("/torrent/fileList")
            .and_then(Value::as_str)
            .unwrap_or("");
        Ok(parse_gazelle_file_list(raw))
    }

    async fn fetch_torrent(&self, remote_id: i64) -> Result<Vec<u8>, SiteError> {
        let url = format!("{}/ajax.php", self.server);
        let id = remote_id.to_string();
        let mut attempt = 0u32;
        loop {
            let _permit = self.limiter.acquire().await;
            let result = self
                .client
                .get(&url)
                .query(&[("action", "download"), ("id", id.as_str())])
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| SiteError::Network(e.to_string()))?;
                    // A JSON body here is an error envelope, not a torrent.
                    if bytes.first() == Some(&b'{') {
                        return Err(SiteError::Api(
                            String::from_utf8_lossy(&bytes[..bytes.len().min(200)]).into_owned(),
                        ));
                    }
                    return Ok(bytes.to_vec());
                }
                Ok(response) => {
                    let status = response.status();
                    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        return Err(SiteError::Auth(format!("HTTP {status}")));
                    }
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(SiteError::Api(format!("HTTP {status}")));
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(if e.is_timeout() {
                            SiteError::Timeout
                        } else {
                            SiteError::Network(e.to_string())
                        });
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_size_accepts_every_numeric_shape() {
        assert_eq!(json_size(&serde_json::json!(30716786)), Some(30716786));
        assert_eq!(json_size(&serde_json::json!(30716786.0)), Some(30716786));
        assert_eq!(json_size(&serde_json::json!("30716786")), Some(30716786));
        assert_eq!(json_size(&serde_json::json!(" 42 ")), Some(42));
        assert_eq!(json_size(&serde_json::json!(null)), None);
        assert_eq!(json_size(&serde_json::json!("not a size")), None);
    }
}
