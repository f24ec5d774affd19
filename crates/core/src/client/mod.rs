//! Torrent client abstraction.
//!
//! A `TorrentClient` trait over the RPC surfaces of the downloaders we can
//! inject into (qBittorrent, Transmission), plus client-URL parsing.

mod client_url;
mod qbittorrent;
mod transmission;
mod types;

use std::sync::Arc;

pub use client_url::{ClientKind, ClientUrl};
pub use qbittorrent::QbittorrentClient;
pub use transmission::TransmissionClient;
pub use types::*;

/// Build a client from a parsed client URL.
pub fn create_client(url: &ClientUrl, timeout_secs: u64) -> Result<Arc<dyn TorrentClient>, ClientError> {
    match url.kind {
        ClientKind::Qbittorrent => Ok(Arc::new(QbittorrentClient::new(url.clone(), timeout_secs))),
        ClientKind::Transmission => Ok(Arc::new(TransmissionClient::new(url.clone(), timeout_secs))),
        ClientKind::Deluge => Err(ClientError::Unsupported(
            "deluge RPC is not implemented; use transmission or qbittorrent".to_string(),
        )),
    }
}
