//! Cloneable write handle for the ledger queue.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::metainfo::InfoHash;

use super::{LedgerOp, OutcomeRecord, RetryEntry};

/// Sends write operations to the `LedgerWriter`. Cheap to clone and share
/// across pipeline workers; a full or closed queue logs and drops rather
/// than failing the caller.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerOp>,
}

impl LedgerHandle {
    pub fn new(tx: mpsc::Sender<LedgerOp>) -> Self {
        Self { tx }
    }

    async fn send(&self, op: LedgerOp) {
        if let Err(e) = self.tx.send(op).await {
            tracing::error!("ledger write dropped: {}", e);
        }
    }

    pub async fn mark_seen(&self, infohash: InfoHash, site_id: &str, torrent_name: &str) {
        self.send(LedgerOp::MarkSeen {
            infohash,
            site_id: site_id.to_string(),
            torrent_name: torrent_name.to_string(),
        })
        .await;
    }

    pub async fn record_outcome(&self, record: OutcomeRecord) {
        self.send(LedgerOp::RecordOutcome(record)).await;
    }

    pub async fn upsert_retry(&self, entry: RetryEntry) {
        self.send(LedgerOp::UpsertRetry(entry)).await;
    }

    pub async fn remove_retry(&self, site_id: &str, remote_id: i64) {
        self.send(LedgerOp::RemoveRetry {
            site_id: site_id.to_string(),
            remote_id,
        })
        .await;
    }

    pub async fn bump_retry(
        &self,
        site_id: &str,
        remote_id: i64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        self.send(LedgerOp::BumpRetry {
            site_id: site_id.to_string(),
            remote_id,
            retry_count,
            next_retry_at,
        })
        .await;
    }
}
