//! Types for reconciliation jobs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::matcher::FileMapping;

/// A reconciliation job: apply an accepted mapping on disk.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub job_id: String,
    /// Save path of the local torrent (sources live under here).
    pub local_root: PathBuf,
    /// Save path the target torrent will be injected with. Usually equals
    /// `local_root`; the staged tree is created under it.
    pub target_root: PathBuf,
    /// Top-level name of the target torrent (directory for multi-file,
    /// file name for single-file).
    pub target_name: String,
    pub mapping: FileMapping,
}

/// What a reconciliation did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub job_id: String,
    pub renamed: usize,
    pub linked: usize,
    /// True when the target layout was already satisfied and nothing moved.
    pub already_in_place: bool,
    pub duration_ms: u64,
}

/// Records every mutation so a failed staging can be undone.
///
/// Paths are undone in reverse order; directories are only removed when
/// empty.
#[derive(Debug, Default)]
pub struct RollbackPlan {
    pub created_paths: Vec<PathBuf>,
    pub created_dirs: Vec<PathBuf>,
    /// Renames as (original, current) pairs, moved back on rollback.
    pub moves: Vec<(PathBuf, PathBuf)>,
}

impl RollbackPlan {
    pub fn record_path(&mut self, path: PathBuf) {
        self.created_paths.push(path);
    }

    pub fn record_dir(&mut self, path: PathBuf) {
        self.created_dirs.push(path);
    }

    pub fn record_move(&mut self, from: PathBuf, to: PathBuf) {
        self.moves.push((from, to));
    }

    pub fn has_changes(&self) -> bool {
        !self.created_paths.is_empty() || !self.created_dirs.is_empty() || !self.moves.is_empty()
    }
}
