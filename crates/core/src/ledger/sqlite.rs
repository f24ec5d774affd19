//! SQLite-backed ledger store.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::metainfo::InfoHash;

use super::{LedgerError, LedgerStore, OutcomeRecord, OutcomeResult, RetryEntry};

/// Single-file SQLite ledger. Migrations are linear and forward-only:
/// tables are created if absent and new columns are added with best-effort
/// `ALTER TABLE`.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn new(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS seen (
                infohash TEXT NOT NULL,
                site_id TEXT NOT NULL,
                torrent_name TEXT,
                scanned_at TEXT NOT NULL,
                PRIMARY KEY (infohash, site_id)
            );

            CREATE TABLE IF NOT EXISTS outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_infohash TEXT NOT NULL,
                site_id TEXT NOT NULL,
                result TEXT NOT NULL,
                candidate_infohash TEXT,
                mapping_summary TEXT,
                timestamp TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT
            );

            CREATE TABLE IF NOT EXISTS retry_ledger (
                site_id TEXT NOT NULL,
                remote_id INTEGER NOT NULL,
                local_infohash TEXT NOT NULL,
                local_name TEXT NOT NULL,
                save_path TEXT NOT NULL,
                source_flag TEXT NOT NULL DEFAULT '',
                mapping TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT NOT NULL,
                added_at TEXT NOT NULL,
                PRIMARY KEY (site_id, remote_id)
            );

            CREATE INDEX IF NOT EXISTS idx_seen_hash ON seen(infohash);
            CREATE INDEX IF NOT EXISTS idx_outcomes_hash ON outcomes(local_infohash);
            CREATE INDEX IF NOT EXISTS idx_retry_due ON retry_ledger(next_retry_at);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn row_to_outcome(row: &rusqlite::Row) -> rusqlite::Result<OutcomeRecord> {
        let local: String = row.get(0)?;
        let site_id: String = row.get(1)?;
        let result: String = row.get(2)?;
        let candidate: Option<String> = row.get(3)?;
        let mapping_summary: Option<String> = row.get(4)?;
        let timestamp: String = row.get(5)?;
        let retry_count: u32 = row.get(6)?;
        let next_retry_at: Option<String> = row.get(7)?;

        Ok(OutcomeRecord {
            local_infohash: local.parse().unwrap_or(InfoHash([0u8; 20])),
            site_id,
            result: serde_json::from_value(serde_json::Value::String(result))
                .unwrap_or(OutcomeResult::InjectFailed),
            candidate_infohash: candidate.and_then(|c| c.parse().ok()),
            mapping_summary,
            timestamp: parse_ts(&timestamp),
            retry_count,
            next_retry_at: next_retry_at.map(|t| parse_ts(&t)),
        })
    }

    fn row_to_retry(row: &rusqlite::Row) -> rusqlite::Result<RetryEntry> {
        let site_id: String = row.get(0)?;
        let remote_id: i64 = row.get(1)?;
        let local_infohash: String = row.get(2)?;
        let local_name: String = row.get(3)?;
        let save_path: String = row.get(4)?;
        let source_flag: String = row.get(5)?;
        let mapping_json: Option<String> = row.get(6)?;
        let retry_count: u32 = row.get(7)?;
        let next_retry_at: String = row.get(8)?;

        Ok(RetryEntry {
            site_id,
            remote_id,
            local_infohash: local_infohash.parse().unwrap_or(InfoHash([0u8; 20])),
            local_name,
            save_path,
            source_flag,
            mapping: mapping_json.and_then(|j| serde_json::from_str(&j).ok()),
            retry_count,
            next_retry_at: parse_ts(&next_retry_at),
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

impl LedgerStore for SqliteLedgerStore {
    fn mark_seen(
        &self,
        infohash: &InfoHash,
        site_id: &str,
        torrent_name: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO seen (infohash, site_id, torrent_name, scanned_at) VALUES (?, ?, ?, ?)",
            params![
                infohash.to_string(),
                site_id,
                torrent_name,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn is_seen(&self, infohash: &InfoHash, site_id: Option<&str>) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let found = match site_id {
            None => conn
                .query_row(
                    "SELECT 1 FROM seen WHERE infohash = ? LIMIT 1",
                    params![infohash.to_string()],
                    |_| Ok(()),
                )
                .is_ok(),
            Some(site) => conn
                .query_row(
                    "SELECT 1 FROM seen WHERE infohash = ? AND site_id = ? LIMIT 1",
                    params![infohash.to_string(), site],
                    |_| Ok(()),
                )
                .is_ok(),
        };
        Ok(found)
    }

    fn record_outcome(&self, record: &OutcomeRecord) -> Result<(), LedgerError> {
        let result_tag = record.result.to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outcomes (local_infohash, site_id, result, candidate_infohash, mapping_summary, timestamp, retry_count, next_retry_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.local_infohash.to_string(),
                record.site_id,
                result_tag,
                record.candidate_infohash.map(|h| h.to_string()),
                record.mapping_summary,
                record.timestamp.to_rfc3339(),
                record.retry_count,
                record.next_retry_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn outcomes_for(&self, infohash: &InfoHash) -> Result<Vec<OutcomeRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT local_infohash, site_id, result, candidate_infohash, mapping_summary, timestamp, retry_count, next_retry_at \
                 FROM outcomes WHERE local_infohash = ? ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![infohash.to_string()], Self::row_to_outcome)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn upsert_retry(&self, entry: &RetryEntry) -> Result<(), LedgerError> {
        let mapping_json = entry
            .mapping
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO retry_ledger \
             (site_id, remote_id, local_infohash, local_name, save_path, source_flag, mapping, retry_count, next_retry_at, added_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.site_id,
                entry.remote_id,
                entry.local_infohash.to_string(),
                entry.local_name,
                entry.save_path,
                entry.source_flag,
                mapping_json,
                entry.retry_count,
                entry.next_retry_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn remove_retry(&self, site_id: &str, remote_id: i64) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM retry_ledger WHERE site_id = ? AND remote_id = ?",
            params![site_id, remote_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn bump_retry(
        &self,
        site_id: &str,
        remote_id: i64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        match next_retry_at {
            Some(at) => conn.execute(
                "UPDATE retry_ledger SET retry_count = ?, next_retry_at = ? WHERE site_id = ? AND remote_id = ?",
                params![retry_count, at.to_rfc3339(), site_id, remote_id],
            ),
            // Exhausted: keep the row as a permanent-failure record far in
            // the future so sweeps never pick it up again.
            None => conn.execute(
                "UPDATE retry_ledger SET retry_count = ?, next_retry_at = '9999-01-01T00:00:00Z' WHERE site_id = ? AND remote_id = ?",
                params![retry_count, site_id, remote_id],
            ),
        }
        .map_err(db_err)?;
        Ok(())
    }

    fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryEntry>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT site_id, remote_id, local_infohash, local_name, save_path, source_flag, mapping, retry_count, next_retry_at \
                 FROM retry_ledger WHERE next_retry_at <= ? ORDER BY next_retry_at ASC LIMIT ?",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now.to_rfc3339(), limit as i64], Self::row_to_retry)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{FileAction, FileMapping};
    use chrono::Duration;

    fn hash(byte: u8) -> InfoHash {
        InfoHash([byte; 20])
    }

    fn entry(site: &str, id: i64, due_in_secs: i64) -> RetryEntry {
        RetryEntry {
            site_id: site.into(),
            remote_id: id,
            local_infohash: hash(1),
            local_name: "Album".into(),
            save_path: "/data".into(),
            source_flag: "RED".into(),
            mapping: Some(FileMapping {
                actions: vec![FileAction::Identical {
                    local: "Album/01.flac".into(),
                    target: "Album/01.flac".into(),
                    length: 100,
                }],
                matched_bytes: 100,
                unsatisfied_bytes: 0,
            }),
            retry_count: 0,
            next_retry_at: Utc::now() + Duration::seconds(due_in_secs),
        }
    }

    #[test]
    fn seen_roundtrip() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        assert!(!store.is_seen(&hash(1), None).unwrap());
        store.mark_seen(&hash(1), "redacted.sh", "Album").unwrap();
        assert!(store.is_seen(&hash(1), None).unwrap());
        assert!(store.is_seen(&hash(1), Some("redacted.sh")).unwrap());
        assert!(!store.is_seen(&hash(1), Some("orpheus.network")).unwrap());
    }

    #[test]
    fn retry_roundtrip_preserves_mapping() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.upsert_retry(&entry("redacted.sh", 7, -10)).unwrap();

        let due = store.due_retries(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        let got = &due[0];
        assert_eq!(got.remote_id, 7);
        let mapping = got.mapping.as_ref().unwrap();
        assert_eq!(mapping.actions.len(), 1);
        assert_eq!(mapping.matched_bytes, 100);
    }

    #[test]
    fn future_retries_are_not_due() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.upsert_retry(&entry("redacted.sh", 7, 3600)).unwrap();
        assert!(store.due_retries(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn bump_without_deadline_parks_the_entry() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.upsert_retry(&entry("redacted.sh", 7, -10)).unwrap();
        store.bump_retry("redacted.sh", 7, 5, None).unwrap();
        assert!(store.due_retries(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn remove_retry_deletes_the_row() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        store.upsert_retry(&entry("redacted.sh", 7, -10)).unwrap();
        store.remove_retry("redacted.sh", 7).unwrap();
        assert!(store.due_retries(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn outcomes_append_in_order() {
        let store = SqliteLedgerStore::in_memory().unwrap();
        for (i, result) in [OutcomeResult::NoCandidates, OutcomeResult::Matched]
            .into_iter()
            .enumerate()
        {
            store
                .record_outcome(&OutcomeRecord {
                    local_infohash: hash(3),
                    site_id: format!("site-{i}"),
                    result,
                    candidate_infohash: None,
                    mapping_summary: None,
                    timestamp: Utc::now(),
                    retry_count: 0,
                    next_retry_at: None,
                })
                .unwrap();
        }
        let outcomes = store.outcomes_for(&hash(3)).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result, OutcomeResult::NoCandidates);
        assert_eq!(outcomes[1].result, OutcomeResult::Matched);
    }
}
