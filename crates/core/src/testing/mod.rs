//! Test doubles for the seam traits and synthetic torrent construction.
//!
//! Compiled into the library so integration tests and downstream crates can
//! exercise the pipeline without a real client or tracker.

mod mock_client;
mod mock_site;
mod torrent_builder;

pub use mock_client::MockClient;
pub use mock_site::MockSite;
pub use torrent_builder::TorrentBuilder;
