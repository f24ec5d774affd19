//! Pipeline states, configuration and run results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::matcher::MatchPolicy;
use crate::metainfo::InfoHash;
use crate::search::SearchConfig;

/// Where a pipeline run currently is, or how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Gated,
    Searching,
    Matching,
    Reconciling,
    Injecting,
    Verifying,
    PostProcessing,
    Done,
    Skipped,
    NoMatch,
    DownloadFailed,
    InjectFailed,
    VerifyFailed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done
                | PipelineState::Skipped
                | PipelineState::NoMatch
                | PipelineState::DownloadFailed
                | PipelineState::InjectFailed
                | PipelineState::VerifyFailed
        )
    }
}

/// Knobs for a pipeline run, assembled from configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tracker hosts eligible for cross-seeding; empty allows all.
    pub check_trackers: Vec<String>,
    /// Only process torrents that contain audio files.
    pub check_music_only: bool,
    /// Reject torrents containing mp3 files.
    pub exclude_mp3: bool,
    /// Dry run: stop after matching, download nothing.
    pub no_download: bool,
    pub auto_start_torrents: bool,
    /// Label applied to injected torrents.
    pub label: String,
    /// Optional label applied to the source torrent after a match.
    pub source_label: Option<String>,
    pub policy: MatchPolicy,
    pub search: SearchConfig,
    pub fetch_timeout_secs: u64,
    pub inject_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub verify_poll_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            check_trackers: Vec::new(),
            check_music_only: true,
            exclude_mp3: true,
            no_download: false,
            auto_start_torrents: true,
            label: "nemorosa".to_string(),
            source_label: None,
            policy: MatchPolicy::default(),
            search: SearchConfig::default(),
            fetch_timeout_secs: 30,
            inject_timeout_secs: 30,
            verify_timeout_secs: 600,
            verify_poll_secs: 5,
        }
    }
}

/// Terminal outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Matched {
        site_id: String,
        remote_id: i64,
        candidate_infohash: Option<InfoHash>,
        mapping_summary: String,
    },
    Skipped {
        reason: String,
    },
    NoMatch {
        candidates_seen: usize,
    },
    DownloadFailed {
        site_id: String,
        remote_id: i64,
    },
    InjectFailed {
        detail: String,
    },
    VerifyFailed {
        site_id: String,
        remote_id: i64,
    },
}

impl RunOutcome {
    pub fn state(&self) -> PipelineState {
        match self {
            RunOutcome::Matched { .. } => PipelineState::Done,
            RunOutcome::Skipped { .. } => PipelineState::Skipped,
            RunOutcome::NoMatch { .. } => PipelineState::NoMatch,
            RunOutcome::DownloadFailed { .. } => PipelineState::DownloadFailed,
            RunOutcome::InjectFailed { .. } => PipelineState::InjectFailed,
            RunOutcome::VerifyFailed { .. } => PipelineState::VerifyFailed,
        }
    }
}

/// Result of running the pipeline for one local torrent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub infohash: InfoHash,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// Live view of pipeline jobs for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: Uuid,
    pub infohash: InfoHash,
    pub state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal jobs kept around for inspection.
const MAX_FINISHED_JOBS: usize = 200;

/// Registry of running and recently finished pipeline jobs.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, infohash: InfoHash) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= MAX_FINISHED_JOBS {
            // Drop the oldest finished entries.
            let mut finished: Vec<(Uuid, DateTime<Utc>)> = jobs
                .iter()
                .filter(|(_, j)| j.state.is_terminal())
                .map(|(id, j)| (*id, j.updated_at))
                .collect();
            finished.sort_by_key(|(_, at)| *at);
            for (old, _) in finished.into_iter().take(jobs.len() - MAX_FINISHED_JOBS + 1) {
                jobs.remove(&old);
            }
        }
        jobs.insert(
            id,
            JobEntry {
                id,
                infohash,
                state: PipelineState::Gated,
                detail: None,
                started_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub async fn update(&self, id: Uuid, state: PipelineState) {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.state = state;
            job.updated_at = Utc::now();
        }
    }

    pub async fn finish(&self, id: Uuid, state: PipelineState, detail: Option<String>) {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.state = state;
            job.detail = detail;
            job.updated_at = Utc::now();
        }
    }

    pub async fn snapshot(&self) -> Vec<JobEntry> {
        let mut jobs: Vec<JobEntry> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.started_at));
        jobs
    }
}
