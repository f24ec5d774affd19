//! Orchestrator types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metainfo::InfoHash;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("torrent {0} not found in client or cache")]
    UnknownHash(InfoHash),

    #[error("torrent {0} is already being processed")]
    Busy(InfoHash),

    #[error("announce could not be resolved to a local torrent")]
    Unresolvable,

    #[error("deadline exceeded")]
    Timeout,

    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),

    #[error(transparent)]
    Client(#[from] crate::client::ClientError),

    #[error(transparent)]
    Ledger(#[from] crate::ledger::LedgerError),
}

/// Payload of an announce webhook. Resolution tries the hash first, then
/// normalized name plus size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub info_hash: Option<InfoHash>,
    pub name: Option<String>,
    pub size: Option<u64>,
}

/// Totals from one full scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub matched: usize,
    pub skipped: usize,
    pub no_match: usize,
    pub failed: usize,
}
