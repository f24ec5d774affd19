//! Gazelle-family tracker site adapters.
//!
//! A `TrackerSite` trait over the operations the search strategy needs, with
//! a JSON-API variant and an HTML-scrape variant. Every request goes through
//! a per-site limiter: a concurrency semaphore plus token-bucket pacing.

mod gazelle_html;
mod gazelle_json;
mod limiter;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metainfo::InfoHash;

pub use gazelle_html::GazelleHtml;
pub use gazelle_json::GazelleJson;
pub use limiter::{SiteLimiter, TokenBucket};

/// Errors surfaced by site adapters, after their internal retries.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("request timeout")]
    Timeout,

    #[error("unexpected response: {0}")]
    Parse(String),
}

impl SiteError {
    /// Transient errors are retried in place by the adapter.
    pub fn is_transient(&self) -> bool {
        matches!(self, SiteError::Network(_) | SiteError::Timeout)
    }
}

/// A torrent listed on a target site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTorrent {
    pub remote_id: i64,
    pub title: Option<String>,
    pub size: Option<u64>,
}

/// Operations a Gazelle-family site exposes to the search strategy.
#[async_trait]
pub trait TrackerSite: Send + Sync {
    /// Stable identifier, the server host (e.g. `redacted.sh`).
    fn site_id(&self) -> &str;

    /// Tracker announce domain, used for allow-lists and dedupe.
    fn tracker_domain(&self) -> &str;

    /// Source flag the site sets in its torrents' info dicts.
    fn source_flag(&self) -> &str;

    /// Exact lookup by infohash. `None` when the site has no such torrent.
    async fn search_by_hash(&self, hash: &InfoHash) -> Result<Option<RemoteTorrent>, SiteError>;

    /// Filelist substring search.
    async fn search_by_filename(&self, query: &str) -> Result<Vec<RemoteTorrent>, SiteError>;

    /// Per-file breakdown of a listed torrent, keyed by content-relative
    /// path. Cheaper than `fetch_torrent` and not charged against download
    /// limits; an empty map means the site cannot provide one.
    async fn fetch_file_list(&self, remote_id: i64) -> Result<HashMap<String, u64>, SiteError>;

    /// Download the .torrent bytes for a listed torrent.
    async fn fetch_torrent(&self, remote_id: i64) -> Result<Vec<u8>, SiteError>;
}

/// Source flags that identify the same content under an older site
/// identity, tried by the hash ladder after the site's own flag.
pub fn source_flag_aliases(flag: &str) -> &'static [&'static str] {
    match flag {
        "RED" => &["PTH"],
        "OPS" => &["APL"],
        _ => &[],
    }
}

/// Best-effort source flag for a known server host.
pub fn infer_source_flag(host: &str) -> &'static str {
    match host {
        h if h.contains("redacted") => "RED",
        h if h.contains("orpheus") => "OPS",
        h if h.contains("dicmusic") || h.contains("52dic") => "DICMusic",
        _ => "",
    }
}

/// Decode Gazelle's `fileList` string: `name{{{size}}}` entries joined by
/// `|||`, HTML-entity escaped.
pub fn parse_gazelle_file_list(raw: &str) -> HashMap<String, u64> {
    let mut files = HashMap::new();
    for entry in raw.split("|||") {
        let Some((name, size)) = entry.split_once("{{{") else {
            continue;
        };
        let size = size.trim_end_matches("}}}").trim();
        if let Ok(size) = size.parse::<u64>() {
            files.insert(unescape_html(name.trim()), size);
        }
    }
    files
}

fn unescape_html(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_decodes_entries() {
        let raw = "01 - Intro.flac{{{30716786}}}|||02 - Song &amp; Dance.flac{{{25123456}}}";
        let files = parse_gazelle_file_list(raw);
        assert_eq!(files.len(), 2);
        assert_eq!(files["01 - Intro.flac"], 30716786);
        assert_eq!(files["02 - Song & Dance.flac"], 25123456);
    }

    #[test]
    fn file_list_skips_malformed_entries() {
        let files = parse_gazelle_file_list("broken|||ok.flac{{{10}}}");
        assert_eq!(files.len(), 1);
        assert_eq!(files["ok.flac"], 10);
    }

    #[test]
    fn aliases_follow_site_lineage() {
        assert_eq!(source_flag_aliases("RED"), &["PTH"]);
        assert_eq!(source_flag_aliases("OPS"), &["APL"]);
        assert!(source_flag_aliases("XYZ").is_empty());
    }

    #[test]
    fn infers_flags_for_known_hosts() {
        assert_eq!(infer_source_flag("redacted.sh"), "RED");
        assert_eq!(infer_source_flag("orpheus.network"), "OPS");
        assert_eq!(infer_source_flag("example.org"), "");
    }
}
