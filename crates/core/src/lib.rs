//! Match-and-reconcile engine for cross-seeding music torrents.
//!
//! Given a torrent already seeded by a local client, the engine locates the
//! same release on Gazelle-family target sites, maps the local files onto
//! the candidate's layout (tolerating renames, artwork drift and Unicode
//! noise), reconciles the on-disk layout with rename/link primitives, and
//! injects the target torrent so both identities seed the same bytes.

pub mod cache;
pub mod client;
pub mod config;
pub mod ledger;
pub mod matcher;
pub mod metainfo;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod search;
pub mod sites;
pub mod testing;

pub use cache::TorrentInfoCache;
pub use client::{create_client, ClientUrl, TorrentClient};
pub use config::{
    build_sites, create_default_config, load_config, validate_config, Config, ConfigError,
};
pub use ledger::{create_ledger, default_db_path, LedgerHandle, LedgerStore, SqliteLedgerStore};
pub use matcher::{FileMapping, LinkingMode, MatchPolicy};
pub use metainfo::{InfoHash, Metainfo};
pub use models::LocalTorrent;
pub use orchestrator::{AnnounceRequest, Orchestrator, OrchestratorError};
pub use pipeline::{JobRegistry, MatchPipeline, PipelineConfig, PipelineRunResult, RunOutcome};
pub use reconcile::{FsReconciler, Reconciler};
pub use sites::TrackerSite;
