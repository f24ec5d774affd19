//! Ledger record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matcher::FileMapping;
use crate::metainfo::InfoHash;

/// Terminal result of one pipeline run against one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    Matched,
    NoCandidates,
    AllRejected,
    DownloadFailed,
    InjectFailed,
    VerifyFailed,
}

impl OutcomeResult {
    /// Only download failures re-enter the retry ledger.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutcomeResult::DownloadFailed)
    }
}

impl fmt::Display for OutcomeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeResult::Matched => "matched",
            OutcomeResult::NoCandidates => "no_candidates",
            OutcomeResult::AllRejected => "all_rejected",
            OutcomeResult::DownloadFailed => "download_failed",
            OutcomeResult::InjectFailed => "inject_failed",
            OutcomeResult::VerifyFailed => "verify_failed",
        };
        f.write_str(s)
    }
}

/// One appended outcome. Append-only apart from the retry columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub local_infohash: InfoHash,
    pub site_id: String,
    pub result: OutcomeResult,
    pub candidate_infohash: Option<InfoHash>,
    pub mapping_summary: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Full fetch context for a failed download, so a retry can skip the
/// search phase and go straight back to the stored candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub site_id: String,
    pub remote_id: i64,
    pub local_infohash: InfoHash,
    pub local_name: String,
    pub save_path: String,
    pub source_flag: String,
    /// Present when matching had already succeeded (the failure was at
    /// inject time); absent when the .torrent fetch itself failed, in
    /// which case the retry re-runs the matcher on the fetched metainfo.
    pub mapping: Option<FileMapping>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// Write operations accepted by the ledger queue.
#[derive(Debug, Clone)]
pub enum LedgerOp {
    MarkSeen {
        infohash: InfoHash,
        site_id: String,
        torrent_name: String,
    },
    RecordOutcome(OutcomeRecord),
    UpsertRetry(RetryEntry),
    RemoveRetry {
        site_id: String,
        remote_id: i64,
    },
    BumpRetry {
        site_id: String,
        remote_id: i64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    },
}
