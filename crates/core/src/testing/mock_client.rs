//! Scriptable in-memory torrent client.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{AddTorrent, ClientError, ClientTorrentInfo, TorrentClient, TorrentState};
use crate::metainfo::InfoHash;

/// A `TorrentClient` backed by in-memory state.
pub struct MockClient {
    torrents: Mutex<HashMap<InfoHash, ClientTorrentInfo>>,
    metainfo: Mutex<HashMap<InfoHash, Vec<u8>>>,
    /// Status answers per hash, consumed in order; the last one repeats.
    statuses: Mutex<HashMap<InfoHash, VecDeque<(TorrentState, f64)>>>,
    pub added: Mutex<Vec<AddTorrent>>,
    pub rechecked: Mutex<Vec<InfoHash>>,
    pub labeled: Mutex<Vec<(InfoHash, String)>>,
    add_fails: bool,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            torrents: Mutex::new(HashMap::new()),
            metainfo: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            rechecked: Mutex::new(Vec::new()),
            labeled: Mutex::new(Vec::new()),
            add_fails: false,
        }
    }

    pub fn with_torrent(self, info: ClientTorrentInfo, metainfo: Vec<u8>) -> Self {
        self.metainfo.lock().unwrap().insert(info.hash, metainfo);
        self.torrents.lock().unwrap().insert(info.hash, info);
        self
    }

    pub fn with_statuses(self, hash: InfoHash, steps: Vec<(TorrentState, f64)>) -> Self {
        self.statuses.lock().unwrap().insert(hash, steps.into());
        self
    }

    pub fn with_add_failure(mut self) -> Self {
        self.add_fails = true;
        self
    }

    pub fn contains(&self, hash: &InfoHash) -> bool {
        self.torrents.lock().unwrap().contains_key(hash)
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TorrentClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_hashes(&self) -> Result<Vec<InfoHash>, ClientError> {
        let mut hashes: Vec<InfoHash> = self.torrents.lock().unwrap().keys().copied().collect();
        hashes.sort();
        Ok(hashes)
    }

    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo, ClientError> {
        self.torrents
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| ClientError::TorrentNotFound(hash.to_string()))
    }

    async fn fetch_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>, ClientError> {
        self.metainfo
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| ClientError::TorrentNotFound(hash.to_string()))
    }

    async fn add_torrent(&self, req: AddTorrent) -> Result<(), ClientError> {
        if self.add_fails {
            return Err(ClientError::ApiError("mock add failure".into()));
        }
        let parsed = crate::metainfo::Metainfo::parse(&req.metainfo)
            .map_err(|e| ClientError::ApiError(e.to_string()))?;
        let hash = parsed
            .infohash()
            .map_err(|e| ClientError::ApiError(e.to_string()))?;
        let info = ClientTorrentInfo {
            hash,
            name: parsed.name().to_string(),
            save_path: req.save_path.clone(),
            state: if req.paused {
                TorrentState::Paused
            } else {
                TorrentState::Checking
            },
            progress: 0.0,
            total_size: parsed.total_size(),
            trackers: parsed.announce().into_iter().collect(),
            label: Some(req.label.clone()),
        };
        self.metainfo
            .lock()
            .unwrap()
            .insert(hash, req.metainfo.clone());
        self.torrents.lock().unwrap().insert(hash, info);
        self.added.lock().unwrap().push(req);
        Ok(())
    }

    async fn recheck(&self, hash: &InfoHash) -> Result<(), ClientError> {
        if !self.contains(hash) {
            return Err(ClientError::TorrentNotFound(hash.to_string()));
        }
        self.rechecked.lock().unwrap().push(*hash);
        Ok(())
    }

    async fn status(&self, hash: &InfoHash) -> Result<(TorrentState, f64), ClientError> {
        let mut statuses = self.statuses.lock().unwrap();
        if let Some(steps) = statuses.get_mut(hash) {
            if steps.len() > 1 {
                return Ok(steps.pop_front().unwrap());
            }
            if let Some(&last) = steps.front() {
                return Ok(last);
            }
        }
        let torrents = self.torrents.lock().unwrap();
        torrents
            .get(hash)
            .map(|t| (t.state, t.progress))
            .ok_or_else(|| ClientError::TorrentNotFound(hash.to_string()))
    }

    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<(), ClientError> {
        if let Some(t) = self.torrents.lock().unwrap().get_mut(hash) {
            t.label = Some(label.to_string());
        }
        self.labeled
            .lock()
            .unwrap()
            .push((*hash, label.to_string()));
        Ok(())
    }
}
