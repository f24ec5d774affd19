//! Scriptable in-memory tracker site.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::metainfo::InfoHash;
use crate::sites::{RemoteTorrent, SiteError, TrackerSite};

/// A `TrackerSite` whose answers are fixed up front.
pub struct MockSite {
    site_id: String,
    tracker_domain: String,
    source_flag: String,
    hash_results: Mutex<HashMap<InfoHash, RemoteTorrent>>,
    name_results: Mutex<Vec<RemoteTorrent>>,
    file_lists: Mutex<HashMap<i64, HashMap<String, u64>>>,
    torrents: Mutex<HashMap<i64, Vec<u8>>>,
    auth_failed: bool,
    fetch_fails: bool,
    /// Every query issued against this site, for assertions.
    pub queries: Mutex<Vec<String>>,
}

impl MockSite {
    pub fn new(site_id: &str, tracker_domain: &str, source_flag: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            tracker_domain: tracker_domain.to_string(),
            source_flag: source_flag.to_string(),
            hash_results: Mutex::new(HashMap::new()),
            name_results: Mutex::new(Vec::new()),
            file_lists: Mutex::new(HashMap::new()),
            torrents: Mutex::new(HashMap::new()),
            auth_failed: false,
            fetch_fails: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hash_hit(self, hash: InfoHash, remote: RemoteTorrent) -> Self {
        self.hash_results.lock().unwrap().insert(hash, remote);
        self
    }

    pub fn with_name_hits(self, hits: Vec<RemoteTorrent>) -> Self {
        *self.name_results.lock().unwrap() = hits;
        self
    }

    pub fn with_file_list(self, remote_id: i64, files: &[(&str, u64)]) -> Self {
        let files = files
            .iter()
            .map(|(name, size)| (name.to_string(), *size))
            .collect();
        self.file_lists.lock().unwrap().insert(remote_id, files);
        self
    }

    pub fn with_torrent(self, remote_id: i64, bytes: Vec<u8>) -> Self {
        self.torrents.lock().unwrap().insert(remote_id, bytes);
        self
    }

    pub fn with_auth_failure(mut self) -> Self {
        self.auth_failed = true;
        self
    }

    pub fn with_fetch_failure(mut self) -> Self {
        self.fetch_fails = true;
        self
    }
}

#[async_trait]
impl TrackerSite for MockSite {
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
        if self.auth_failed {
            return Err(SiteError::Auth("mock auth failure".into()));
        }
        self.queries.lock().unwrap().push(format!("hash:{hash}"));
        Ok(self.hash_results.lock().unwrap().get(hash).cloned())
    }

    async fn search_by_filename(&self, query: &str) -> Result<Vec<RemoteTorrent>, SiteError> {
        if self.auth_failed {
            return Err(SiteError::Auth("mock auth failure".into()));
        }
        self.queries.lock().unwrap().push(format!("name:{query}"));
        Ok(self.name_results.lock().unwrap().clone())
    }

    async fn fetch_file_list(&self, remote_id: i64) -> Result<HashMap<String, u64>, SiteError> {
        if self.auth_failed {
            return Err(SiteError::Auth("mock auth failure".into()));
        }
        self.queries
            .lock()
            .unwrap()
            .push(format!("filelist:{remote_id}"));
        Ok(self
            .file_lists
            .lock()
            .unwrap()
            .get(&remote_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_torrent(&self, remote_id: i64) -> Result<Vec<u8>, SiteError> {
        if self.fetch_fails {
            return Err(SiteError::Network("mock fetch failure".into()));
        }
        self.torrents
            .lock()
            .unwrap()
            .get(&remote_id)
            .cloned()
            .ok_or_else(|| SiteError::Api(format!("no torrent {remote_id}")))
    }
}
