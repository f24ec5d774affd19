//! Ledger storage trait.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::metainfo::InfoHash;

use super::{OutcomeRecord, RetryEntry};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(String),
}

/// Storage backend for the seen set, outcomes and retry ledger.
///
/// Reads are cheap and callable from anywhere; writes should go through the
/// `LedgerHandle` queue so they serialize.
pub trait LedgerStore: Send + Sync {
    fn mark_seen(
        &self,
        infohash: &InfoHash,
        site_id: &str,
        torrent_name: &str,
    ) -> Result<(), LedgerError>;

    /// Seen on any site when `site_id` is `None`.
    fn is_seen(&self, infohash: &InfoHash, site_id: Option<&str>) -> Result<bool, LedgerError>;

    fn record_outcome(&self, record: &OutcomeRecord) -> Result<(), LedgerError>;

    fn outcomes_for(&self, infohash: &InfoHash) -> Result<Vec<OutcomeRecord>, LedgerError>;

    fn upsert_retry(&self, entry: &RetryEntry) -> Result<(), LedgerError>;

    fn remove_retry(&self, site_id: &str, remote_id: i64) -> Result<(), LedgerError>;

    fn bump_retry(
        &self,
        site_id: &str,
        remote_id: i64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError>;

    /// Retry entries whose `next_retry_at` has passed, oldest first.
    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryEntry>, LedgerError>;
}
