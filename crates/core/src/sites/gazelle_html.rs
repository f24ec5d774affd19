//! Gazelle HTML adapter for API-less sites.
//!
//! Cookie-authenticated scraping of `torrents.php`. Only filename search
//! and torrent download are possible; hash lookup has no HTML surface.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use reqwest::{header, Client, StatusCode};
use tracing::debug;

use crate::metainfo::InfoHash;

use super::{RemoteTorrent, SiteError, SiteLimiter, TrackerSite};

const MAX_ATTEMPTS: u32 = 3;

static TORRENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"torrents\.php\?id=\d+&amp;torrentid=(\d+)").expect("valid regex"));

/// Cookie-authenticated Gazelle site scraped from HTML.
pub struct GazelleHtml {
    client: Client,
    server: String,
    site_id: String,
    tracker_domain: String,
    source_flag: String,
    limiter: SiteLimiter,
}

impl GazelleHtml {
    pub fn new(
        server: &str,
        cookie: &str,
        tracker_domain: &str,
        source_flag: &str,
        max_concurrent: usize,
        requests_per_minute: u32,
        timeout_secs: u64,
    ) -> Result<Self, SiteError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::COOKIE,
            header::HeaderValue::from_str(cookie)
                .map_err(|_| SiteError::Auth("cookie is not a valid header value".into()))?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .user_agent(concat!("nemorosa/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
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

    async fn get(&self, path_and_query: &str) -> Result<reqwest::Response, SiteError> {
        let url = format!("{}{}", self.server, path_and_query);
        let mut attempt = 0u32;
        loop {
            let _permit = self.limiter.acquire().await;
            match self.client.get(&url).send().await {
                Ok(response) => {
                    // An expired session bounces to the login page.
                    if response.status().is_redirection() {
                        let to = response
                            .headers()
                            .get(header::LOCATION)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("");
                        if to.contains("login.php") {
                            return Err(SiteError::Auth("session cookie expired".into()));
                        }
                    }
                    if response.status() == StatusCode::TOO_MANY_REQUESTS {
                        let wait = response
                            .headers()
                            .get(header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(10);
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }
                    if !response.status().is_success() {
                        return Err(SiteError::Api(format!("HTTP {}", response.status())));
                    }
                    return Ok(response);
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
                    debug!("{}: retrying after {}", self.site_id, e);
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
    }
}

#[async_trait]
impl TrackerSite for GazelleHtml {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    fn tracker_domain(&self) -> &str {
        &self.tracker_domain
    }

    fn source_flag(&self) -> &str {
        &self.source_flag
    }

    async fn search_by_hash(&self, _hash: &InfoHash) -> Result<Option<RemoteTorrent>, SiteError> {
        // No HTML surface for hash lookup.
        Ok(None)
    }

    async fn search_by_filename(&self, query: &str) -> Result<Vec<RemoteTorrent>, SiteError> {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let response = self
            .get(&format!("/torrents.php?filelist={encoded}&order_by=seeders"))
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| SiteError::Network(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        let mut torrents = Vec::new();
        for caps in TORRENT_ID_RE.captures_iter(&body) {
            if let Ok(id) = caps[1].parse::<i64>() {
                if seen.insert(id) {
                    torrents.push(RemoteTorrent {
                        remote_id: id,
                        title: None,
                        size: None,
                    });
                }
            }
        }
        Ok(torrents)
    }

    async fn fetch_file_list(
        &self,
        _remote_id: i64,
    ) -> Result<std::collections::HashMap<String, u64>, SiteError> {
        // No cheap HTML surface for a file list; the matcher verifies the
        // fetched torrent instead.
        Ok(std::collections::HashMap::new())
    }

    async fn fetch_torrent(&self, remote_id: i64) -> Result<Vec<u8>, SiteError> {
        let response = self
            .get(&format!("/torrents.php?action=download&id={remote_id}"))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SiteError::Network(e.to_string()))?;
        if bytes.first() != Some(&b'd') {
            return Err(SiteError::Parse("response is not a torrent".into()));
        }
        Ok(bytes.to_vec())
    }
}
