//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Pipelines running at once during a full scan.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Tracker hosts eligible for scanning; empty allows all.
    #[serde(default)]
    pub check_trackers: Vec<String>,
    /// Deadline for an announce-triggered run.
    #[serde(default = "default_announce_timeout")]
    pub announce_timeout_secs: u64,
    /// Attempts before a retry entry is parked permanently.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Base of the exponential retry backoff.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    /// Backoff ceiling.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
    /// Interval between cache polls against the client.
    #[serde(default = "default_cache_poll")]
    pub cache_poll_secs: u64,
    /// Scheduled full scans; absent disables them.
    #[serde(default)]
    pub search_cadence_secs: Option<u64>,
    /// Scheduled retry sweeps; absent disables them.
    #[serde(default)]
    pub retry_cadence_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            check_trackers: Vec::new(),
            announce_timeout_secs: default_announce_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            cache_poll_secs: default_cache_poll(),
            search_cadence_secs: None,
            retry_cadence_secs: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    8
}

fn default_announce_timeout() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    300
}

fn default_retry_max_delay() -> u64 {
    6 * 60 * 60
}

fn default_cache_poll() -> u64 {
    300
}
