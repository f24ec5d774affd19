//! Filesystem reconciliation of accepted mappings.
//!
//! Materializes the target torrent's layout from the local files using
//! rename/link primitives, staging into a temporary sibling directory and
//! swapping it in atomically.

mod error;
mod fs_reconciler;
mod traits;
mod types;

pub use error::ReconcileError;
pub use fs_reconciler::FsReconciler;
pub use traits::Reconciler;
pub use types::{ReconcileJob, ReconcileReport, RollbackPlan};
