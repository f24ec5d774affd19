//! Domain types shared across the engine.

use serde::{Deserialize, Serialize};

use crate::metainfo::{FileEntry, InfoHash, Metainfo};

/// A torrent held by the local client, as projected by the info cache.
#[derive(Debug, Clone)]
pub struct LocalTorrent {
    pub infohash: InfoHash,
    pub save_path: String,
    pub trackers: Vec<String>,
    pub metainfo: Metainfo,
}

impl LocalTorrent {
    pub fn name(&self) -> &str {
        self.metainfo.name()
    }

    pub fn files(&self) -> &[FileEntry] {
        self.metainfo.files()
    }

    pub fn piece_length(&self) -> u64 {
        self.metainfo.piece_length()
    }

    pub fn total_size(&self) -> u64 {
        self.metainfo.total_size()
    }

    pub fn source_flag(&self) -> Option<&str> {
        self.metainfo.source()
    }

    /// Path of file `i` relative to the save path, root directory included.
    pub fn full_path(&self, i: usize) -> String {
        full_path(&self.metainfo, i)
    }
}

/// A search hit that has not been fetched yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRef {
    pub site_id: String,
    pub remote_id: i64,
    pub title: Option<String>,
    pub size: Option<u64>,
    pub origin: CandidateOrigin,
}

/// How a candidate was found; hash hits are trusted pairings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateOrigin {
    HashHit { infohash: InfoHash },
    NameHit { similarity: f64 },
}

impl CandidateRef {
    pub fn is_hash_hit(&self) -> bool {
        matches!(self.origin, CandidateOrigin::HashHit { .. })
    }
}

/// A fetched candidate, alive for one pipeline execution.
#[derive(Debug, Clone)]
pub struct CandidateTorrent {
    pub site_id: String,
    pub remote_id: i64,
    pub metainfo: Metainfo,
    /// Source flag the target site expects in injected torrents.
    pub source_flag: String,
    /// Hash-ladder hits skip piece re-verification in the matcher.
    pub trusted: bool,
}

impl CandidateTorrent {
    pub fn name(&self) -> &str {
        self.metainfo.name()
    }

    pub fn files(&self) -> &[FileEntry] {
        self.metainfo.files()
    }

    pub fn full_path(&self, i: usize) -> String {
        full_path(&self.metainfo, i)
    }
}

fn full_path(metainfo: &Metainfo, i: usize) -> String {
    let file = &metainfo.files()[i];
    if metainfo.is_multi_file() {
        format!("{}/{}", metainfo.name(), file.path)
    } else {
        file.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TorrentBuilder;

    #[test]
    fn full_path_includes_root_for_multi_file() {
        let meta = TorrentBuilder::new("Album", 16384).file("01.flac", 10).build();
        let local = LocalTorrent {
            infohash: meta.infohash().unwrap(),
            save_path: "/data".into(),
            trackers: vec![],
            metainfo: meta,
        };
        assert_eq!(local.full_path(0), "Album/01.flac");
    }

    #[test]
    fn full_path_is_bare_for_single_file() {
        let meta = TorrentBuilder::new("Track.flac", 16384).single_file(10).build();
        let local = LocalTorrent {
            infohash: meta.infohash().unwrap(),
            save_path: "/data".into(),
            trackers: vec![],
            metainfo: meta,
        };
        assert_eq!(local.full_path(0), "Track.flac");
    }
}
