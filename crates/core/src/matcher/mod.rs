//! File matching between a local torrent and a candidate torrent.
//!
//! Decides whether a candidate is acceptable and how every candidate file
//! maps onto the local layout. Pure synchronous code; the pipeline calls it
//! between the search and reconcile stages.

mod engine;
mod types;

pub use engine::match_torrents;
pub use types::{
    FileAction, FileMapping, LinkingMode, MatchPolicy, MatchVerdict, RejectReason,
};
