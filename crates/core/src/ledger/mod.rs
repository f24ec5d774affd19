//! Persistent bookkeeping: the Seen set, the outcome log and the retry
//! ledger.
//!
//! All writes funnel through a single background writer fed by a cloneable
//! handle; reads go straight to the store. This keeps every pipeline worker
//! free of write contention while the log stays strictly ordered.

mod handle;
mod sqlite;
mod store;
mod types;
mod writer;

use std::path::PathBuf;

pub use handle::LedgerHandle;
pub use sqlite::SqliteLedgerStore;
pub use store::{LedgerError, LedgerStore};
pub use types::{LedgerOp, OutcomeRecord, OutcomeResult, RetryEntry};
pub use writer::{create_ledger, LedgerWriter};

/// Database location: `NEMOROSA_DB` when set (containers), otherwise the
/// platform user-data directory.
pub fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("NEMOROSA_DB") {
        return PathBuf::from(path);
    }
    directories::ProjectDirs::from("", "", "nemorosa")
        .map(|dirs| dirs.data_dir().join("nemorosa.db"))
        .unwrap_or_else(|| PathBuf::from("nemorosa.db"))
}
