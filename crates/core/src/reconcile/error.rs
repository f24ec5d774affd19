//! Reconciler error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("source file not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("destination already exists: {path}")]
    DestinationExists { path: PathBuf },

    #[error("failed to create directory {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no link mode could materialize {path}: {detail}")]
    LinkFailed { path: PathBuf, detail: String },

    #[error("staged file {path} has length {actual}, expected {expected}")]
    LengthMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("mapping contains an action the reconciler cannot execute: {0}")]
    UnsupportedAction(String),

    #[error("rollback failed: {reason}")]
    RollbackFailed { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
