//! Local index of client state.
//!
//! Persists a projection of every torrent the client holds (metainfo blob,
//! save path, trackers) keyed by infohash, plus an in-memory name index so
//! announce matching resolves in constant time. Refreshes are incremental:
//! only hashes the client gained since the last poll are fetched.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::TorrentClient;
use crate::metainfo::{InfoHash, Metainfo};
use crate::models::LocalTorrent;
use crate::normalize::{self, Profile};

/// Fraction of previously-known hashes that must disappear in one poll
/// before the cache assumes a client reset and rebuilds from scratch.
const RESET_THRESHOLD: f64 = 0.5;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(String),

    #[error("client error: {0}")]
    Client(#[from] crate::client::ClientError),
}

/// Result of one refresh pass.
#[derive(Debug, Clone, Default)]
pub struct RefreshStats {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
    pub rebuilt: bool,
}

/// Persistent snapshot of client state with an announce-matching index.
pub struct TorrentInfoCache {
    conn: Mutex<Connection>,
    /// loose-normalized torrent name -> (total size, hash)
    by_name: RwLock<HashMap<String, Vec<(u64, InfoHash)>>>,
}

impl TorrentInfoCache {
    pub fn new(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        let cache = Self {
            conn: Mutex::new(conn),
            by_name: RwLock::new(HashMap::new()),
        };
        cache.load_index()?;
        Ok(cache)
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            by_name: RwLock::new(HashMap::new()),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS torrents (
                infohash TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                save_path TEXT NOT NULL,
                trackers TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                piece_length INTEGER NOT NULL,
                metainfo BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_torrents_name ON torrents(name);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_index(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT infohash, name, total_size FROM torrents")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let hash: String = row.get(0)?;
                let name: String = row.get(1)?;
                let size: u64 = row.get(2)?;
                Ok((hash, name, size))
            })
            .map_err(db_err)?;

        let mut index: HashMap<String, Vec<(u64, InfoHash)>> = HashMap::new();
        for row in rows {
            let (hash, name, size) = row.map_err(db_err)?;
            if let Ok(hash) = hash.parse::<InfoHash>() {
                index
                    .entry(normalize::normalize(&name, Profile::Loose))
                    .or_default()
                    .push((size, hash));
            }
        }
        *self.by_name.write().unwrap() = index;
        Ok(())
    }

    /// All hashes currently cached.
    pub fn known_hashes(&self) -> Result<HashSet<InfoHash>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT infohash FROM torrents")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut hashes = HashSet::new();
        for row in rows {
            if let Ok(hash) = row.map_err(db_err)?.parse() {
                hashes.insert(hash);
            }
        }
        Ok(hashes)
    }

    /// Full projection for one hash.
    pub fn get(&self, hash: &InfoHash) -> Result<Option<LocalTorrent>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT save_path, trackers, metainfo FROM torrents WHERE infohash = ?",
            params![hash.to_string()],
            |row| {
                let save_path: String = row.get(0)?;
                let trackers: String = row.get(1)?;
                let metainfo: Vec<u8> = row.get(2)?;
                Ok((save_path, trackers, metainfo))
            },
        );
        match result {
            Ok((save_path, trackers, metainfo)) => {
                let metainfo = match Metainfo::parse(&metainfo) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("cached metainfo for {} is corrupt: {}", hash, e);
                        return Ok(None);
                    }
                };
                Ok(Some(LocalTorrent {
                    infohash: *hash,
                    save_path,
                    trackers: serde_json::from_str(&trackers).unwrap_or_default(),
                    metainfo,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Announce matching: resolve a torrent name (and size, when known) to
    /// a cached hash without touching the client.
    pub fn by_name(&self, name: &str, size: Option<u64>) -> Option<InfoHash> {
        let key = normalize::normalize(name, Profile::Loose);
        let index = self.by_name.read().unwrap();
        let entries = index.get(&key)?;
        match size {
            Some(size) => entries.iter().find(|(s, _)| *s == size).map(|(_, h)| *h),
            None => entries.first().map(|(_, h)| *h),
        }
    }

    /// Hashes whose trackers match the allow-list (all when the list is
    /// empty), in deterministic order.
    pub fn all_filtered(&self, allow_list: &[String]) -> Result<Vec<InfoHash>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT infohash, trackers FROM torrents ORDER BY infohash")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let hash: String = row.get(0)?;
                let trackers: String = row.get(1)?;
                Ok((hash, trackers))
            })
            .map_err(db_err)?;

        let mut hashes = Vec::new();
        for row in rows {
            let (hash, trackers) = row.map_err(db_err)?;
            let Ok(hash) = hash.parse::<InfoHash>() else {
                continue;
            };
            if allow_list.is_empty() {
                hashes.push(hash);
                continue;
            }
            let trackers: Vec<String> = serde_json::from_str(&trackers).unwrap_or_default();
            if trackers
                .iter()
                .any(|t| allow_list.iter().any(|allowed| t.contains(allowed.as_str())))
            {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    fn insert(&self, torrent: &LocalTorrent, raw_metainfo: &[u8]) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO torrents (infohash, name, save_path, trackers, total_size, piece_length, metainfo, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                torrent.infohash.to_string(),
                torrent.name(),
                torrent.save_path,
                serde_json::to_string(&torrent.trackers).unwrap_or_else(|_| "[]".into()),
                torrent.total_size(),
                torrent.piece_length(),
                raw_metainfo,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, hash: &InfoHash) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM torrents WHERE infohash = ?",
            params![hash.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM torrents", []).map_err(db_err)?;
        Ok(())
    }

    /// Diff the client against the cache and fetch metainfo only for the
    /// torrents the client gained. `force` rebuilds from scratch.
    pub async fn refresh(
        &self,
        client: &dyn TorrentClient,
        force: bool,
    ) -> Result<RefreshStats, CacheError> {
        let client_hashes: HashSet<InfoHash> = client.list_hashes().await?.into_iter().collect();
        let mut known = self.known_hashes()?;

        let mut stats = RefreshStats::default();

        let unknown_prior = known.difference(&client_hashes).count();
        let reset_detected =
            !known.is_empty() && (unknown_prior as f64 / known.len() as f64) > RESET_THRESHOLD;
        if force || reset_detected {
            if reset_detected {
                warn!(
                    "client reset detected ({} of {} cached hashes gone), rebuilding cache",
                    unknown_prior,
                    known.len()
                );
            }
            self.clear()?;
            known.clear();
            stats.rebuilt = true;
        }

        for gone in known.difference(&client_hashes) {
            self.remove(gone)?;
            stats.removed += 1;
        }

        for hash in client_hashes.iter() {
            if known.contains(hash) {
                continue;
            }
            let info = match client.get_info(hash).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("skipping {}: {}", hash, e);
                    continue;
                }
            };
            let raw = match client.fetch_metainfo(hash).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("no metainfo for {}: {}", hash, e);
                    continue;
                }
            };
            let metainfo = match Metainfo::parse(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("unparseable metainfo for {}: {}", hash, e);
                    continue;
                }
            };
            let torrent = LocalTorrent {
                infohash: *hash,
                save_path: info.save_path,
                trackers: info.trackers,
                metainfo,
            };
            self.insert(&torrent, &raw)?;
            stats.added += 1;
            debug!("cached {} ({})", torrent.name(), hash);
        }

        stats.total = client_hashes.len();
        self.rebuild_index()?;
        if stats.added > 0 || stats.removed > 0 {
            info!(
                "cache refreshed: +{} -{} ({} total)",
                stats.added, stats.removed, stats.total
            );
        }
        Ok(stats)
    }

    fn rebuild_index(&self) -> Result<(), CacheError> {
        let entries: Vec<(String, u64, InfoHash)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT name, total_size, infohash FROM torrents")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let name: String = row.get(0)?;
                    let size: u64 = row.get(1)?;
                    let hash: String = row.get(2)?;
                    Ok((name, size, hash))
                })
                .map_err(db_err)?;
            rows.filter_map(|r| r.ok())
                .filter_map(|(name, size, hash)| hash.parse().ok().map(|h| (name, size, h)))
                .collect()
        };

        let mut index: HashMap<String, Vec<(u64, InfoHash)>> = HashMap::new();
        for (name, size, hash) in entries {
            index
                .entry(normalize::normalize(&name, Profile::Loose))
                .or_default()
                .push((size, hash));
        }
        *self.by_name.write().unwrap() = index;
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> CacheError {
    CacheError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientTorrentInfo, TorrentState};
    use crate::testing::{MockClient, TorrentBuilder};

    fn client_with(names: &[&str]) -> (MockClient, Vec<InfoHash>) {
        let mut client = MockClient::new();
        let mut hashes = Vec::new();
        for name in names {
            let meta = TorrentBuilder::new(name, 16384)
                .file("01.flac", 1000)
                .announce("https://flacsfor.me/announce")
                .build();
            let hash = meta.infohash().unwrap();
            let raw = meta.encode().unwrap();
            client = client.with_torrent(
                ClientTorrentInfo {
                    hash,
                    name: name.to_string(),
                    save_path: "/data".into(),
                    state: TorrentState::Seeding,
                    progress: 1.0,
                    total_size: 1000,
                    trackers: vec!["https://flacsfor.me/announce".into()],
                    label: None,
                },
                raw,
            );
            hashes.push(hash);
        }
        (client, hashes)
    }

    #[tokio::test]
    async fn refresh_adds_new_torrents() {
        let cache = TorrentInfoCache::in_memory().unwrap();
        let (client, hashes) = client_with(&["Album A", "Album B"]);

        let stats = cache.refresh(&client, false).await.unwrap();
        assert_eq!(stats.added, 2);
        assert_eq!(stats.total, 2);

        let torrent = cache.get(&hashes[0]).unwrap().unwrap();
        assert_eq!(torrent.name(), "Album A");
        assert_eq!(torrent.save_path, "/data");
    }

    #[tokio::test]
    async fn refresh_is_incremental() {
        let cache = TorrentInfoCache::in_memory().unwrap();
        let (client, _) = client_with(&["Album A"]);
        cache.refresh(&client, false).await.unwrap();

        let stats = cache.refresh(&client, false).await.unwrap();
        assert_eq!(stats.added, 0);
        assert_eq!(stats.removed, 0);
    }

    #[tokio::test]
    async fn by_name_resolves_announce_tuples() {
        let cache = TorrentInfoCache::in_memory().unwrap();
        let (client, hashes) = client_with(&["Artist - Album (2020)"]);
        cache.refresh(&client, false).await.unwrap();

        // Loose normalization tolerates case and zero-width drift.
        let hit = cache.by_name("artist - album\u{200B} (2020)", Some(1000));
        assert_eq!(hit, Some(hashes[0]));

        assert!(cache.by_name("artist - album (2020)", Some(7)).is_none());
        assert!(cache.by_name("unknown", None).is_none());
    }

    #[tokio::test]
    async fn force_refresh_rebuilds() {
        let cache = TorrentInfoCache::in_memory().unwrap();
        let (client, _) = client_with(&["Album A"]);
        cache.refresh(&client, false).await.unwrap();
        let stats = cache.refresh(&client, true).await.unwrap();
        assert!(stats.rebuilt);
        assert_eq!(stats.added, 1);
    }

    #[tokio::test]
    async fn all_filtered_respects_allow_list() {
        let cache = TorrentInfoCache::in_memory().unwrap();
        let (client, hashes) = client_with(&["Album A"]);
        cache.refresh(&client, false).await.unwrap();

        assert_eq!(cache.all_filtered(&[]).unwrap(), {
            let mut h = hashes.clone();
            h.sort_by_key(|h| h.to_string());
            h
        });
        assert_eq!(
            cache.all_filtered(&["flacsfor.me".into()]).unwrap().len(),
            1
        );
        assert!(cache
            .all_filtered(&["other.tracker".into()])
            .unwrap()
            .is_empty());
    }
}
