//! Types for torrent client operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metainfo::InfoHash;

/// Errors from client RPC operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("invalid client URL: {0}")]
    InvalidUrl(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("request timeout")]
    Timeout,

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Coarse torrent state, unified across client backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    Downloading,
    Seeding,
    Paused,
    Checking,
    Queued,
    Error,
    Unknown,
}

impl TorrentState {
    /// True once a recheck has finished and the data was accepted.
    pub fn is_settled(&self) -> bool {
        !matches!(self, TorrentState::Checking | TorrentState::Queued)
    }
}

/// Client view of one torrent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTorrentInfo {
    pub hash: InfoHash,
    pub name: String,
    pub save_path: String,
    pub state: TorrentState,
    /// Completion fraction in `0.0..=1.0`.
    pub progress: f64,
    pub total_size: u64,
    pub trackers: Vec<String>,
    pub label: Option<String>,
}

/// Parameters for injecting a torrent.
#[derive(Debug, Clone)]
pub struct AddTorrent {
    pub metainfo: Vec<u8>,
    pub save_path: String,
    pub label: String,
    pub paused: bool,
}

/// RPC surface the engine relies on. All operations are async and cheap to
/// retry; adapters map backend errors into `ClientError`.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// All infohashes currently in the client.
    async fn list_hashes(&self) -> Result<Vec<InfoHash>, ClientError>;

    /// Details for one torrent.
    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo, ClientError>;

    /// Raw metainfo bytes for a torrent the client holds.
    async fn fetch_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>, ClientError>;

    /// Inject a torrent.
    async fn add_torrent(&self, req: AddTorrent) -> Result<(), ClientError>;

    /// Trigger a hash recheck.
    async fn recheck(&self, hash: &InfoHash) -> Result<(), ClientError>;

    /// Current state and progress.
    async fn status(&self, hash: &InfoHash) -> Result<(TorrentState, f64), ClientError>;

    /// Replace the label/category of a torrent.
    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<(), ClientError>;
}
