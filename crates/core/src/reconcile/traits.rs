//! Reconciler trait.

use async_trait::async_trait;

use super::{ReconcileError, ReconcileJob, ReconcileReport};

/// Applies accepted mappings to the filesystem.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Execute a job. On error, no partial state remains: staging is
    /// deleted and any renames are undone.
    async fn reconcile(&self, job: ReconcileJob) -> Result<ReconcileReport, ReconcileError>;
}
