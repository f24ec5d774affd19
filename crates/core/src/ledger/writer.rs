//! Background task draining the ledger write queue.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{LedgerHandle, LedgerOp, LedgerStore};

/// Consumes queued write operations until every handle is dropped.
pub struct LedgerWriter {
    rx: mpsc::Receiver<LedgerOp>,
    store: Arc<dyn LedgerStore>,
}

impl LedgerWriter {
    pub fn new(rx: mpsc::Receiver<LedgerOp>, store: Arc<dyn LedgerStore>) -> Self {
        Self { rx, store }
    }

    /// Run the writer; spawn this as a background task.
    pub async fn run(mut self) {
        tracing::debug!("ledger writer started");
        while let Some(op) = self.rx.recv().await {
            let result = match &op {
                LedgerOp::MarkSeen {
                    infohash,
                    site_id,
                    torrent_name,
                } => self.store.mark_seen(infohash, site_id, torrent_name),
                LedgerOp::RecordOutcome(record) => self.store.record_outcome(record),
                LedgerOp::UpsertRetry(entry) => self.store.upsert_retry(entry),
                LedgerOp::RemoveRetry { site_id, remote_id } => {
                    self.store.remove_retry(site_id, *remote_id)
                }
                LedgerOp::BumpRetry {
                    site_id,
                    remote_id,
                    retry_count,
                    next_retry_at,
                } => self
                    .store
                    .bump_retry(site_id, *remote_id, *retry_count, *next_retry_at),
            };
            if let Err(e) = result {
                tracing::error!("ledger write failed: {}", e);
            }
        }
        tracing::debug!("ledger writer shutting down");
    }
}

/// Wire up a ledger: returns the shared handle and the writer task.
pub fn create_ledger(
    store: Arc<dyn LedgerStore>,
    buffer_size: usize,
) -> (LedgerHandle, LedgerWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (LedgerHandle::new(tx), LedgerWriter::new(rx, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{OutcomeRecord, OutcomeResult, SqliteLedgerStore};
    use crate::metainfo::InfoHash;
    use chrono::Utc;

    fn hash(byte: u8) -> InfoHash {
        InfoHash([byte; 20])
    }

    #[tokio::test]
    async fn writes_drain_through_the_queue() {
        let store = Arc::new(SqliteLedgerStore::in_memory().unwrap());
        let store_dyn: Arc<dyn LedgerStore> = store.clone();
        let (handle, writer) = create_ledger(store_dyn, 16);
        let task = tokio::spawn(writer.run());

        handle.mark_seen(hash(1), "redacted.sh", "Album").await;
        handle
            .record_outcome(OutcomeRecord {
                local_infohash: hash(1),
                site_id: "redacted.sh".into(),
                result: OutcomeResult::Matched,
                candidate_infohash: Some(hash(2)),
                mapping_summary: Some("1 identical".into()),
                timestamp: Utc::now(),
                retry_count: 0,
                next_retry_at: None,
            })
            .await;

        drop(handle);
        task.await.unwrap();

        assert!(store.is_seen(&hash(1), None).unwrap());
        assert!(store.is_seen(&hash(1), Some("redacted.sh")).unwrap());
        assert!(!store.is_seen(&hash(1), Some("other.site")).unwrap());
        let outcomes = store.outcomes_for(&hash(1)).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result, OutcomeResult::Matched);
    }
}
