//! Types for the file matcher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How files that need to appear under a new path are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkingMode {
    /// No links; path changes require in-place renames.
    None,
    Hard,
    Sym,
    Reflink,
}

impl Default for LinkingMode {
    fn default() -> Self {
        LinkingMode::Hard
    }
}

/// Policy knobs the matcher runs under.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    pub linking_mode: LinkingMode,
    /// Allow destructive in-place renames of the local layout. Only set when
    /// the injected torrent replaces the local one instead of adding a
    /// second seed.
    pub allow_rename: bool,
    /// Tolerate unverifiable piece geometry (reflink re-materializes
    /// boundary content on divergence).
    pub allow_partial_pieces: bool,
    /// Budget for target-declared bytes we may leave unsatisfied.
    pub max_missing_bytes: u64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            linking_mode: LinkingMode::Hard,
            allow_rename: false,
            allow_partial_pieces: false,
            // Covers typical artwork plus a log or cue sheet.
            max_missing_bytes: 4 * 1024 * 1024,
        }
    }
}

/// One decided action for a target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    /// Same bytes at the same relative path.
    Identical { local: String, target: String, length: u64 },
    /// Same bytes, different path; the original moves.
    Rename { local: String, target: String, length: u64 },
    /// Same bytes reachable under a new root through a link.
    Link {
        local: String,
        target: String,
        length: u64,
        mode: LinkingMode,
    },
    /// Target file deliberately left unsatisfied (small non-essential).
    Skip { target: String, length: u64 },
    /// Target file with no local counterpart.
    Missing { target: String, length: u64 },
}

impl FileAction {
    pub fn target(&self) -> &str {
        match self {
            FileAction::Identical { target, .. }
            | FileAction::Rename { target, .. }
            | FileAction::Link { target, .. }
            | FileAction::Skip { target, .. }
            | FileAction::Missing { target, .. } => target,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            FileAction::Identical { length, .. }
            | FileAction::Rename { length, .. }
            | FileAction::Link { length, .. }
            | FileAction::Skip { length, .. }
            | FileAction::Missing { length, .. } => *length,
        }
    }

    /// True for actions that leave the target file absent.
    pub fn is_unsatisfied(&self) -> bool {
        matches!(self, FileAction::Skip { .. } | FileAction::Missing { .. })
    }
}

/// Accepted mapping: one action per target file, in deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    pub actions: Vec<FileAction>,
    pub matched_bytes: u64,
    pub unsatisfied_bytes: u64,
}

impl FileMapping {
    /// One-line summary for logs, outcome records and webhook responses.
    pub fn summary(&self) -> String {
        let mut identical = 0usize;
        let mut renamed = 0usize;
        let mut linked = 0usize;
        let mut skipped = 0usize;
        let mut missing = 0usize;
        for action in &self.actions {
            match action {
                FileAction::Identical { .. } => identical += 1,
                FileAction::Rename { .. } => renamed += 1,
                FileAction::Link { .. } => linked += 1,
                FileAction::Skip { .. } => skipped += 1,
                FileAction::Missing { .. } => missing += 1,
            }
        }
        format!(
            "{} identical, {} renamed, {} linked, {} skipped, {} missing ({} bytes unsatisfied)",
            identical, renamed, linked, skipped, missing, self.unsatisfied_bytes
        )
    }

    /// Whether the reconciler has any filesystem work to do.
    pub fn needs_reconcile(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, FileAction::Rename { .. } | FileAction::Link { .. }))
    }
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SizeMismatch,
    PieceMismatch,
    Conflict,
    TooMuchMissing,
    LinkingRequiredDisabled,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::SizeMismatch => "size_mismatch",
            RejectReason::PieceMismatch => "piece_mismatch",
            RejectReason::Conflict => "conflict",
            RejectReason::TooMuchMissing => "too_much_missing",
            RejectReason::LinkingRequiredDisabled => "linking_required_disabled",
        };
        f.write_str(s)
    }
}

/// Matcher output.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchVerdict {
    Accepted(FileMapping),
    Rejected(RejectReason),
}

impl MatchVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MatchVerdict::Accepted(_))
    }
}
