//! Configuration types.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::matcher::{LinkingMode, MatchPolicy};
use crate::orchestrator::OrchestratorConfig;
use crate::pipeline::PipelineConfig;
use crate::search::SearchConfig;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, rename = "global")]
    pub global: GlobalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub downloader: DownloaderConfig,
    #[serde(default, rename = "target_site")]
    pub target_sites: Vec<TargetSiteConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Global behavior switches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Dry run: match but never download or inject.
    #[serde(default)]
    pub no_download: bool,
    #[serde(default = "default_true")]
    pub exclude_mp3: bool,
    /// Tracker hosts eligible for cross-seeding; null allows all.
    #[serde(default)]
    pub check_trackers: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub check_music_only: bool,
    #[serde(default = "default_true")]
    pub auto_start_torrents: bool,
    #[serde(default)]
    pub linking: LinkingConfig,
    #[serde(default = "default_max_missing_bytes")]
    pub max_missing_bytes: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            no_download: false,
            exclude_mp3: true,
            check_trackers: None,
            check_music_only: true,
            auto_start_torrents: true,
            linking: LinkingConfig::default(),
            max_missing_bytes: default_max_missing_bytes(),
        }
    }
}

/// How reconciliation materializes renamed paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkingConfig {
    #[serde(default)]
    pub mode: LinkingMode,
    /// Tolerate unverifiable piece geometry. Reflink only.
    #[serde(default)]
    pub allow_partial_pieces: bool,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            mode: LinkingMode::Hard,
            allow_partial_pieces: false,
        }
    }
}

/// Webhook server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

/// The torrent client torrents are injected into.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloaderConfig {
    /// `{kind}+{scheme}://user:pass@host:port[/path][?torrents_dir=…]`
    pub client: String,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

/// One Gazelle-family target site.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetSiteConfig {
    pub server: String,
    /// Announce domain of the site's tracker.
    pub tracker: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    /// Source flag override; inferred from the server host when absent.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_site_concurrency")]
    pub max_concurrent: usize,
    #[serde(default = "default_site_rpm")]
    pub requests_per_minute: u32,
}

/// Operation deadlines.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_search_timeout")]
    pub search_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_secs: u64,
    #[serde(default = "default_inject_timeout")]
    pub inject_secs: u64,
    #[serde(default = "default_verify_timeout")]
    pub verify_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            search_secs: default_search_timeout(),
            fetch_secs: default_fetch_timeout(),
            inject_secs: default_inject_timeout(),
            verify_secs: default_verify_timeout(),
        }
    }
}

impl Config {
    /// Tracker allow-list as the engine consumes it: empty means all.
    pub fn check_trackers(&self) -> Vec<String> {
        self.global.check_trackers.clone().unwrap_or_default()
    }

    /// Assemble the pipeline configuration from the relevant sections.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            check_trackers: self.check_trackers(),
            check_music_only: self.global.check_music_only,
            exclude_mp3: self.global.exclude_mp3,
            no_download: self.global.no_download,
            auto_start_torrents: self.global.auto_start_torrents,
            label: self.downloader.label.clone(),
            source_label: None,
            policy: MatchPolicy {
                linking_mode: self.global.linking.mode,
                // In-place renames are the only relocation tool without
                // links, and imply the injected torrent replaces the local
                // layout.
                allow_rename: self.global.linking.mode == LinkingMode::None,
                allow_partial_pieces: self.global.linking.allow_partial_pieces,
                max_missing_bytes: self.global.max_missing_bytes,
            },
            search: SearchConfig {
                site_timeout_secs: self.timeouts.search_secs,
                ..SearchConfig::default()
            },
            fetch_timeout_secs: self.timeouts.fetch_secs,
            inject_timeout_secs: self.timeouts.inject_secs,
            verify_timeout_secs: self.timeouts.verify_secs,
            verify_poll_secs: 5,
        }
    }

    /// Orchestrator configuration with the allow-list applied.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            check_trackers: self.check_trackers(),
            ..self.orchestrator.clone()
        }
    }
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_missing_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_host() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    8256
}

fn default_label() -> String {
    "nemorosa".to_string()
}

fn default_client_timeout() -> u64 {
    30
}

fn default_site_concurrency() -> usize {
    4
}

fn default_site_rpm() -> u32 {
    30
}

fn default_search_timeout() -> u64 {
    15
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_inject_timeout() -> u64 {
    30
}

fn default_verify_timeout() -> u64 {
    600
}
