//! The pipeline state machine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{AddTorrent, TorrentClient, TorrentState};
use crate::ledger::{LedgerHandle, LedgerStore, OutcomeRecord, OutcomeResult, RetryEntry};
use crate::matcher::{self, FileMapping, MatchVerdict};
use crate::metainfo::{InfoHash, Metainfo};
use crate::models::{CandidateRef, CandidateTorrent, LocalTorrent};
use crate::normalize;
use crate::reconcile::{ReconcileJob, Reconciler};
use crate::search::{self, SearchOutcome};
use crate::sites::TrackerSite;

use super::types::{JobRegistry, PipelineConfig, PipelineRunResult, PipelineState, RunOutcome};

/// A fetched, matched candidate ready for reconciliation.
struct Winner {
    candidate: CandidateTorrent,
    raw: Vec<u8>,
    mapping: FileMapping,
}

/// Drives local torrents through the match state machine.
pub struct MatchPipeline {
    sites: Vec<Arc<dyn TrackerSite>>,
    client: Arc<dyn TorrentClient>,
    reconciler: Arc<dyn Reconciler>,
    ledger: LedgerHandle,
    store: Arc<dyn LedgerStore>,
    jobs: Arc<JobRegistry>,
    config: PipelineConfig,
}

impl MatchPipeline {
    pub fn new(
        sites: Vec<Arc<dyn TrackerSite>>,
        client: Arc<dyn TorrentClient>,
        reconciler: Arc<dyn Reconciler>,
        ledger: LedgerHandle,
        store: Arc<dyn LedgerStore>,
        jobs: Arc<JobRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sites,
            client,
            reconciler,
            ledger,
            store,
            jobs,
            config,
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Run the full state machine for one local torrent.
    pub async fn process(&self, local: &LocalTorrent, force: bool) -> PipelineRunResult {
        let job = self.jobs.begin(local.infohash).await;
        let outcome = self.run(local, force, job).await;
        self.jobs
            .finish(job, outcome.state(), outcome_detail(&outcome))
            .await;
        info!(
            "{} ({}): {}",
            local.name(),
            local.infohash,
            outcome_line(&outcome)
        );
        PipelineRunResult {
            infohash: local.infohash,
            outcome,
        }
    }

    /// Replay a retry-ledger entry: search is skipped, the stored candidate
    /// is fetched again, and the stored mapping reused when present.
    pub async fn process_retry(
        &self,
        local: &LocalTorrent,
        entry: &RetryEntry,
    ) -> PipelineRunResult {
        let job = self.jobs.begin(local.infohash).await;
        self.jobs.update(job, PipelineState::Matching).await;

        let outcome = match self.sites.iter().find(|s| s.site_id() == entry.site_id) {
            None => RunOutcome::InjectFailed {
                detail: format!("site {} is no longer configured", entry.site_id),
            },
            Some(site) => match self.fetch_candidate(site.as_ref(), entry.remote_id, false).await {
                Err(e) => {
                    debug!("retry fetch failed for {}: {}", entry.remote_id, e);
                    RunOutcome::DownloadFailed {
                        site_id: entry.site_id.clone(),
                        remote_id: entry.remote_id,
                    }
                }
                Ok((candidate, raw)) => {
                    let mapping = match &entry.mapping {
                        Some(mapping) => Some(mapping.clone()),
                        None => match matcher::match_torrents(local, &candidate, &self.config.policy)
                        {
                            MatchVerdict::Accepted(m) => Some(m),
                            MatchVerdict::Rejected(reason) => {
                                debug!("stored candidate now rejects: {}", reason);
                                None
                            }
                        },
                    };
                    match mapping {
                        None => RunOutcome::NoMatch { candidates_seen: 1 },
                        Some(mapping) => {
                            let winner = Winner {
                                candidate,
                                raw,
                                mapping,
                            };
                            self.finalize(local, winner, job).await
                        }
                    }
                }
            },
        };

        self.record_terminal(local, &outcome).await;
        self.jobs
            .finish(job, outcome.state(), outcome_detail(&outcome))
            .await;
        info!(
            "retry {} ({}): {}",
            local.name(),
            local.infohash,
            outcome_line(&outcome)
        );
        PipelineRunResult {
            infohash: local.infohash,
            outcome,
        }
    }

    async fn run(&self, local: &LocalTorrent, force: bool, job: Uuid) -> RunOutcome {
        // Gate
        if let Some(reason) = self.gate(local, force) {
            return RunOutcome::Skipped { reason };
        }

        // Sites the torrent is not already on.
        let sites: Vec<Arc<dyn TrackerSite>> = self
            .sites
            .iter()
            .filter(|site| {
                !local
                    .trackers
                    .iter()
                    .any(|t| t.contains(site.tracker_domain()))
            })
            .cloned()
            .collect();
        if sites.is_empty() {
            return RunOutcome::Skipped {
                reason: "already on every target site".to_string(),
            };
        }

        // Search
        self.jobs.update(job, PipelineState::Searching).await;
        let SearchOutcome {
            candidates,
            auth_failures,
        } = search::find_candidates(local, &sites, &self.config.search).await;
        for site_id in &auth_failures {
            warn!("site {} rejected credentials during this run", site_id);
        }

        if candidates.is_empty() {
            for site in &sites {
                if !auth_failures.contains(&site.site_id().to_string()) {
                    self.record(local, site.site_id(), OutcomeResult::NoCandidates, None, None)
                        .await;
                    self.mark_seen(local, site.site_id()).await;
                }
            }
            return RunOutcome::NoMatch { candidates_seen: 0 };
        }

        // Matching: rank order, first accepted wins.
        self.jobs.update(job, PipelineState::Matching).await;
        let candidates_seen = candidates.len();
        let mut per_site_rejections: HashMap<String, usize> = HashMap::new();
        let mut fetch_failure: Option<(String, i64)> = None;
        let mut winner: Option<Winner> = None;

        for candidate_ref in &candidates {
            let Some(site) = self
                .sites
                .iter()
                .find(|s| s.site_id() == candidate_ref.site_id)
            else {
                continue;
            };
            match self.evaluate(local, site.as_ref(), candidate_ref).await {
                Evaluation::Accepted(w) => {
                    winner = Some(w);
                    break;
                }
                Evaluation::Rejected => {
                    *per_site_rejections
                        .entry(candidate_ref.site_id.clone())
                        .or_default() += 1;
                }
                Evaluation::FetchFailed => {
                    self.record(
                        local,
                        &candidate_ref.site_id,
                        OutcomeResult::DownloadFailed,
                        None,
                        None,
                    )
                    .await;
                    self.ledger
                        .upsert_retry(RetryEntry {
                            site_id: candidate_ref.site_id.clone(),
                            remote_id: candidate_ref.remote_id,
                            local_infohash: local.infohash,
                            local_name: local.name().to_string(),
                            save_path: local.save_path.clone(),
                            source_flag: site.source_flag().to_string(),
                            mapping: None,
                            retry_count: 0,
                            next_retry_at: Utc::now(),
                        })
                        .await;
                    if fetch_failure.is_none() {
                        fetch_failure =
                            Some((candidate_ref.site_id.clone(), candidate_ref.remote_id));
                    }
                }
            }
        }

        let Some(winner) = winner else {
            // Conclude per-site bookkeeping for the no-winner run.
            for site in &sites {
                let site_id = site.site_id();
                let had_candidates = candidates.iter().any(|c| c.site_id == site_id);
                if !had_candidates && !auth_failures.contains(&site_id.to_string()) {
                    self.record(local, site_id, OutcomeResult::NoCandidates, None, None)
                        .await;
                } else if per_site_rejections.contains_key(site_id) {
                    self.record(local, site_id, OutcomeResult::AllRejected, None, None)
                        .await;
                }
                self.mark_seen(local, site_id).await;
            }
            return match fetch_failure {
                Some((site_id, remote_id)) => RunOutcome::DownloadFailed { site_id, remote_id },
                None => RunOutcome::NoMatch { candidates_seen },
            };
        };

        self.mark_seen(local, &winner.candidate.site_id).await;

        if self.config.no_download {
            // Dry run: report the would-be match and stop.
            let outcome = RunOutcome::Matched {
                site_id: winner.candidate.site_id.clone(),
                remote_id: winner.candidate.remote_id,
                candidate_infohash: winner.candidate.metainfo.infohash().ok(),
                mapping_summary: winner.mapping.summary(),
            };
            self.record_terminal(local, &outcome).await;
            return outcome;
        }

        let outcome = self.finalize(local, winner, job).await;
        self.record_terminal(local, &outcome).await;
        outcome
    }

    /// Eligibility checks. Returns the skip reason when gated out.
    fn gate(&self, local: &LocalTorrent, force: bool) -> Option<String> {
        if !force {
            match self.store.is_seen(&local.infohash, None) {
                Ok(true) => return Some("already scanned".to_string()),
                Ok(false) => {}
                Err(e) => warn!("seen lookup failed: {}", e),
            }
        }

        if !self.config.check_trackers.is_empty() {
            let allowed = local.trackers.iter().any(|t| {
                self.config
                    .check_trackers
                    .iter()
                    .any(|allow| t.contains(allow.as_str()))
            });
            if !allowed {
                return Some("tracker not in allow-list".to_string());
            }
        }

        if self.config.check_music_only
            && !local.files().iter().any(|f| normalize::is_audio(&f.path))
        {
            return Some("no audio files".to_string());
        }

        if self.config.exclude_mp3
            && local
                .files()
                .iter()
                .any(|f| normalize::extension(&f.path) == "mp3")
        {
            return Some("mp3 content excluded".to_string());
        }

        None
    }

    async fn evaluate(
        &self,
        local: &LocalTorrent,
        site: &dyn TrackerSite,
        candidate_ref: &CandidateRef,
    ) -> Evaluation {
        let trusted = candidate_ref.is_hash_hit();
        let (candidate, raw) = match self
            .fetch_candidate(site, candidate_ref.remote_id, trusted)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    "failed to fetch candidate {} from {}: {}",
                    candidate_ref.remote_id,
                    site.site_id(),
                    e
                );
                return Evaluation::FetchFailed;
            }
        };

        match matcher::match_torrents(local, &candidate, &self.config.policy) {
            MatchVerdict::Accepted(mapping) => {
                info!(
                    "accepted {} torrent {} for {}: {}",
                    site.site_id(),
                    candidate_ref.remote_id,
                    local.name(),
                    mapping.summary()
                );
                Evaluation::Accepted(Winner {
                    candidate,
                    raw,
                    mapping,
                })
            }
            MatchVerdict::Rejected(reason) => {
                debug!(
                    "rejected {} torrent {} for {}: {}",
                    site.site_id(),
                    candidate_ref.remote_id,
                    local.name(),
                    reason
                );
                Evaluation::Rejected
            }
        }
    }

    async fn fetch_candidate(
        &self,
        site: &dyn TrackerSite,
        remote_id: i64,
        trusted: bool,
    ) -> Result<(CandidateTorrent, Vec<u8>), String> {
        let deadline = Duration::from_secs(self.config.fetch_timeout_secs);
        let raw = tokio::time::timeout(deadline, site.fetch_torrent(remote_id))
            .await
            .map_err(|_| "fetch timeout".to_string())?
            .map_err(|e| e.to_string())?;
        let metainfo = Metainfo::parse(&raw).map_err(|e| e.to_string())?;
        Ok((
            CandidateTorrent {
                site_id: site.site_id().to_string(),
                remote_id,
                metainfo,
                source_flag: site.source_flag().to_string(),
                trusted,
            },
            raw,
        ))
    }

    /// Reconcile, inject, verify and post-process an accepted candidate.
    async fn finalize(&self, local: &LocalTorrent, winner: Winner, job: Uuid) -> RunOutcome {
        let candidate_hash = winner.candidate.metainfo.infohash().ok();
        let site_id = winner.candidate.site_id.clone();
        let remote_id = winner.candidate.remote_id;
        let summary = winner.mapping.summary();

        // Reconciling
        self.jobs.update(job, PipelineState::Reconciling).await;
        if winner.mapping.needs_reconcile() {
            let reconcile_job = ReconcileJob {
                job_id: Uuid::new_v4().to_string(),
                local_root: PathBuf::from(&local.save_path),
                target_root: PathBuf::from(&local.save_path),
                target_name: winner.candidate.name().to_string(),
                mapping: winner.mapping.clone(),
            };
            if let Err(e) = self.reconciler.reconcile(reconcile_job).await {
                return RunOutcome::InjectFailed {
                    detail: format!("reconcile failed: {e}"),
                };
            }
        }

        // Injecting. Not cancelable: this either completes or fails.
        self.jobs.update(job, PipelineState::Injecting).await;
        let add = AddTorrent {
            metainfo: winner.raw.clone(),
            save_path: local.save_path.clone(),
            label: self.config.label.clone(),
            paused: !self.config.auto_start_torrents,
        };
        let inject_deadline = Duration::from_secs(self.config.inject_timeout_secs);
        let injected = tokio::time::timeout(inject_deadline, self.client.add_torrent(add)).await;
        match injected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("inject failed for {}: {}", local.name(), e);
                self.ledger
                    .upsert_retry(RetryEntry {
                        site_id: site_id.clone(),
                        remote_id,
                        local_infohash: local.infohash,
                        local_name: local.name().to_string(),
                        save_path: local.save_path.clone(),
                        source_flag: winner.candidate.source_flag.clone(),
                        mapping: Some(winner.mapping.clone()),
                        retry_count: 0,
                        next_retry_at: Utc::now(),
                    })
                    .await;
                return RunOutcome::DownloadFailed { site_id, remote_id };
            }
            Err(_) => {
                return RunOutcome::DownloadFailed { site_id, remote_id };
            }
        }

        // Verifying
        self.jobs.update(job, PipelineState::Verifying).await;
        if let Some(hash) = candidate_hash {
            if let Err(e) = self.client.recheck(&hash).await {
                debug!("recheck request failed (client may auto-check): {}", e);
            }
            if !self.verify(&hash, &winner).await {
                return RunOutcome::VerifyFailed { site_id, remote_id };
            }
        }

        // PostProcessing
        self.jobs.update(job, PipelineState::PostProcessing).await;
        if let Some(source_label) = &self.config.source_label {
            if let Err(e) = self.client.set_label(&local.infohash, source_label).await {
                warn!("failed to relabel source torrent: {}", e);
            }
        }
        self.ledger.remove_retry(&site_id, remote_id).await;

        RunOutcome::Matched {
            site_id,
            remote_id,
            candidate_infohash: candidate_hash,
            mapping_summary: summary,
        }
    }

    /// Poll the client until the injected torrent settles with enough
    /// progress, or the verify deadline passes.
    async fn verify(&self, hash: &InfoHash, winner: &Winner) -> bool {
        let expected = min_expected_progress(&winner.mapping, &winner.candidate.metainfo);
        let deadline = Instant::now() + Duration::from_secs(self.config.verify_timeout_secs);

        loop {
            match self.client.status(hash).await {
                Ok((TorrentState::Error, _)) => return false,
                Ok((state, progress)) => {
                    if state.is_settled() && progress + 1e-6 >= expected {
                        return true;
                    }
                }
                Err(e) => debug!("status poll failed: {}", e),
            }
            if Instant::now() >= deadline {
                warn!("verify timed out for {}", hash);
                return false;
            }
            tokio::time::sleep(Duration::from_secs(self.config.verify_poll_secs.max(1))).await;
        }
    }

    async fn mark_seen(&self, local: &LocalTorrent, site_id: &str) {
        self.ledger
            .mark_seen(local.infohash, site_id, local.name())
            .await;
    }

    async fn record(
        &self,
        local: &LocalTorrent,
        site_id: &str,
        result: OutcomeResult,
        candidate: Option<InfoHash>,
        summary: Option<String>,
    ) {
        self.ledger
            .record_outcome(OutcomeRecord {
                local_infohash: local.infohash,
                site_id: site_id.to_string(),
                result,
                candidate_infohash: candidate,
                mapping_summary: summary,
                timestamp: Utc::now(),
                retry_count: 0,
                next_retry_at: None,
            })
            .await;
    }

    async fn record_terminal(&self, local: &LocalTorrent, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Matched {
                site_id,
                candidate_infohash,
                mapping_summary,
                ..
            } => {
                self.record(
                    local,
                    site_id,
                    OutcomeResult::Matched,
                    *candidate_infohash,
                    Some(mapping_summary.clone()),
                )
                .await;
            }
            RunOutcome::DownloadFailed { site_id, .. } => {
                self.record(local, site_id, OutcomeResult::DownloadFailed, None, None)
                    .await;
            }
            RunOutcome::InjectFailed { detail } => {
                self.record(
                    local,
                    "",
                    OutcomeResult::InjectFailed,
                    None,
                    Some(detail.clone()),
                )
                .await;
            }
            RunOutcome::VerifyFailed { site_id, .. } => {
                self.record(local, site_id, OutcomeResult::VerifyFailed, None, None)
                    .await;
            }
            RunOutcome::Skipped { .. } | RunOutcome::NoMatch { .. } => {}
        }
    }
}

enum Evaluation {
    Accepted(Winner),
    Rejected,
    FetchFailed,
}

/// The minimum completion fraction a verified injection must reach:
/// matched bytes minus boundary-piece slack around each unsatisfied file.
fn min_expected_progress(mapping: &FileMapping, metainfo: &Metainfo) -> f64 {
    let total = metainfo.total_size();
    if total == 0 {
        return 1.0;
    }
    let unsatisfied = mapping
        .actions
        .iter()
        .filter(|a| a.is_unsatisfied())
        .count() as u64;
    let slack = 2 * metainfo.piece_length() * unsatisfied;
    (mapping.matched_bytes.saturating_sub(slack) as f64 / total as f64).clamp(0.0, 1.0)
}

fn outcome_detail(outcome: &RunOutcome) -> Option<String> {
    match outcome {
        RunOutcome::Matched {
            mapping_summary, ..
        } => Some(mapping_summary.clone()),
        RunOutcome::Skipped { reason } => Some(reason.clone()),
        RunOutcome::InjectFailed { detail } => Some(detail.clone()),
        _ => None,
    }
}

fn outcome_line(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Matched {
            site_id,
            remote_id,
            mapping_summary,
            ..
        } => format!("matched on {site_id} (torrent {remote_id}): {mapping_summary}"),
        RunOutcome::Skipped { reason } => format!("skipped: {reason}"),
        RunOutcome::NoMatch { candidates_seen } => {
            format!("no match ({candidates_seen} candidates evaluated)")
        }
        RunOutcome::DownloadFailed { site_id, remote_id } => {
            format!("download failed for {site_id} torrent {remote_id}")
        }
        RunOutcome::InjectFailed { detail } => format!("inject failed: {detail}"),
        RunOutcome::VerifyFailed { site_id, remote_id } => {
            format!("verify failed for {site_id} torrent {remote_id}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientTorrentInfo;
    use crate::ledger::{create_ledger, SqliteLedgerStore};
    use crate::reconcile::FsReconciler;
    use crate::sites::RemoteTorrent;
    use crate::testing::{MockClient, MockSite, TorrentBuilder};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        local: LocalTorrent,
        store: Arc<SqliteLedgerStore>,
        _writer: tokio::task::JoinHandle<()>,
        ledger: LedgerHandle,
    }

    impl Fixture {
        async fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path();
            tokio::fs::create_dir_all(root.join("Album")).await.unwrap();
            tokio::fs::write(root.join("Album/01.flac"), vec![8u8; 30000])
                .await
                .unwrap();

            let meta = TorrentBuilder::new("Album", 16384)
                .file("01.flac", 30000)
                .announce("https://flacsfor.me/announce")
                .build();
            let local = LocalTorrent {
                infohash: meta.infohash().unwrap(),
                save_path: root.to_string_lossy().to_string(),
                trackers: vec!["https://flacsfor.me/announce".into()],
                metainfo: meta,
            };

            let store = Arc::new(SqliteLedgerStore::in_memory().unwrap());
            let (ledger, writer) = create_ledger(store.clone(), 64);
            let writer = tokio::spawn(writer.run());
            Self {
                _temp: temp,
                local,
                store,
                _writer: writer,
                ledger,
            }
        }

        fn pipeline(
            &self,
            sites: Vec<Arc<dyn TrackerSite>>,
            client: Arc<dyn TorrentClient>,
            config: PipelineConfig,
        ) -> MatchPipeline {
            MatchPipeline::new(
                sites,
                client,
                Arc::new(FsReconciler::new()),
                self.ledger.clone(),
                self.store.clone(),
                Arc::new(JobRegistry::new()),
                config,
            )
        }

        fn fast_config() -> PipelineConfig {
            PipelineConfig {
                verify_timeout_secs: 5,
                verify_poll_secs: 1,
                ..PipelineConfig::default()
            }
        }
    }

    fn client_with_local(fixture: &Fixture) -> MockClient {
        MockClient::new().with_torrent(
            ClientTorrentInfo {
                hash: fixture.local.infohash,
                name: "Album".into(),
                save_path: fixture.local.save_path.clone(),
                state: TorrentState::Seeding,
                progress: 1.0,
                total_size: 30000,
                trackers: fixture.local.trackers.clone(),
                label: None,
            },
            fixture.local.metainfo.encode().unwrap(),
        )
    }

    #[tokio::test]
    async fn hash_hit_matches_and_injects() {
        let fixture = Fixture::new().await;
        let red = fixture.local.metainfo.with_source("RED");
        let red_hash = red.infohash().unwrap();
        let red_bytes = red
            .with_announce("https://flacsfor.me/announce/abc")
            .encode()
            .unwrap();

        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_hash_hit(
                    red_hash,
                    RemoteTorrent {
                        remote_id: 777,
                        title: Some("Album".into()),
                        size: Some(30000),
                    },
                )
                .with_torrent(777, red_bytes),
        );
        let client = Arc::new(
            client_with_local(&fixture)
                .with_statuses(red_hash, vec![(TorrentState::Checking, 0.0), (TorrentState::Seeding, 1.0)]),
        );

        let pipeline = fixture.pipeline(vec![site], client.clone(), Fixture::fast_config());
        let result = pipeline.process(&fixture.local, false).await;

        match &result.outcome {
            RunOutcome::Matched {
                site_id,
                remote_id,
                candidate_infohash,
                ..
            } => {
                assert_eq!(site_id, "redacted.sh");
                assert_eq!(*remote_id, 777);
                assert_eq!(*candidate_infohash, Some(red_hash));
            }
            other => panic!("expected match, got {other:?}"),
        }

        // The injected torrent carried the label and the local save path.
        let added = client.added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].label, "nemorosa");
        assert_eq!(added[0].save_path, fixture.local.save_path);

        // Ledger has the matched outcome and the hash is now seen.
        let outcomes = fixture.store.outcomes_for(&fixture.local.infohash).unwrap();
        assert!(outcomes
            .iter()
            .any(|o| o.result == OutcomeResult::Matched && o.site_id == "redacted.sh"));
        assert!(fixture.store.is_seen(&fixture.local.infohash, None).unwrap());
    }

    #[tokio::test]
    async fn seen_hashes_are_gated() {
        let fixture = Fixture::new().await;
        fixture
            .store
            .mark_seen(&fixture.local.infohash, "redacted.sh", "Album")
            .unwrap();
        let site: Arc<dyn TrackerSite> = Arc::new(MockSite::new("redacted.sh", "red.tracker", "RED"));
        let client = Arc::new(client_with_local(&fixture));

        let pipeline = fixture.pipeline(vec![site], client, Fixture::fast_config());
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(result.outcome, RunOutcome::Skipped { .. }));

        // Forced runs bypass the seen gate.
        let result = pipeline.process(&fixture.local, true).await;
        assert!(!matches!(result.outcome, RunOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn tracker_allow_list_gates() {
        let fixture = Fixture::new().await;
        let site: Arc<dyn TrackerSite> = Arc::new(MockSite::new("redacted.sh", "red.tracker", "RED"));
        let client = Arc::new(client_with_local(&fixture));
        let config = PipelineConfig {
            check_trackers: vec!["other.example".into()],
            ..Fixture::fast_config()
        };

        let pipeline = fixture.pipeline(vec![site], client, config);
        let result = pipeline.process(&fixture.local, false).await;
        match result.outcome {
            RunOutcome::Skipped { reason } => assert!(reason.contains("allow-list")),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_candidates_records_outcome() {
        let fixture = Fixture::new().await;
        let site: Arc<dyn TrackerSite> = Arc::new(MockSite::new("redacted.sh", "red.tracker", "RED"));
        let client = Arc::new(client_with_local(&fixture));

        let pipeline = fixture.pipeline(vec![site], client, Fixture::fast_config());
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(
            result.outcome,
            RunOutcome::NoMatch { candidates_seen: 0 }
        ));

        let outcomes = fixture.store.outcomes_for(&fixture.local.infohash).unwrap();
        assert!(outcomes
            .iter()
            .any(|o| o.result == OutcomeResult::NoCandidates));
    }

    #[tokio::test]
    async fn rejected_candidates_record_all_rejected() {
        let fixture = Fixture::new().await;
        // Same sizes, different content: piece verification rejects.
        let bad = TorrentBuilder::new("Album", 16384)
            .file_with_fill("01.flac", 30000, 99)
            .build();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_name_hits(vec![RemoteTorrent {
                    remote_id: 5,
                    title: Some("Album".into()),
                    size: Some(30000),
                }])
                .with_torrent(5, bad.encode().unwrap()),
        );
        let client = Arc::new(client_with_local(&fixture));

        let pipeline = fixture.pipeline(vec![site], client, Fixture::fast_config());
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(
            result.outcome,
            RunOutcome::NoMatch { candidates_seen: 1 }
        ));

        let outcomes = fixture.store.outcomes_for(&fixture.local.infohash).unwrap();
        assert!(outcomes
            .iter()
            .any(|o| o.result == OutcomeResult::AllRejected));
    }

    #[tokio::test]
    async fn fetch_failure_enters_retry_ledger() {
        let fixture = Fixture::new().await;
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_name_hits(vec![RemoteTorrent {
                    remote_id: 9,
                    title: Some("Album".into()),
                    size: Some(30000),
                }])
                .with_fetch_failure(),
        );
        let client = Arc::new(client_with_local(&fixture));

        let pipeline = fixture.pipeline(vec![site], client, Fixture::fast_config());
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(result.outcome, RunOutcome::DownloadFailed { .. }));

        let due = fixture.store.due_retries(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].remote_id, 9);
        assert!(due[0].mapping.is_none());
    }

    #[tokio::test]
    async fn dry_run_stops_after_matching() {
        let fixture = Fixture::new().await;
        let good = TorrentBuilder::new("Album", 16384)
            .file("01.flac", 30000)
            .build();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_name_hits(vec![RemoteTorrent {
                    remote_id: 5,
                    title: Some("Album".into()),
                    size: Some(30000),
                }])
                .with_torrent(5, good.encode().unwrap()),
        );
        let client = Arc::new(client_with_local(&fixture));
        let config = PipelineConfig {
            no_download: true,
            ..Fixture::fast_config()
        };

        let pipeline = fixture.pipeline(vec![site], client.clone(), config);
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(result.outcome, RunOutcome::Matched { .. }));
        assert!(client.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inject_failure_stores_mapping_for_retry() {
        let fixture = Fixture::new().await;
        let good = TorrentBuilder::new("Album", 16384)
            .file("01.flac", 30000)
            .build();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_name_hits(vec![RemoteTorrent {
                    remote_id: 5,
                    title: Some("Album".into()),
                    size: Some(30000),
                }])
                .with_torrent(5, good.encode().unwrap()),
        );
        let client = Arc::new(client_with_local(&fixture).with_add_failure());

        let pipeline = fixture.pipeline(vec![site], client, Fixture::fast_config());
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(result.outcome, RunOutcome::DownloadFailed { .. }));

        let due = fixture.store.due_retries(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].mapping.is_some());
    }

    #[tokio::test]
    async fn verify_timeout_fails_the_run() {
        let fixture = Fixture::new().await;
        let red = fixture.local.metainfo.with_source("RED");
        let red_hash = red.infohash().unwrap();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_hash_hit(
                    red_hash,
                    RemoteTorrent {
                        remote_id: 7,
                        title: None,
                        size: None,
                    },
                )
                .with_torrent(7, red.encode().unwrap()),
        );
        // The check never finishes.
        let client = Arc::new(
            client_with_local(&fixture)
                .with_statuses(red_hash, vec![(TorrentState::Checking, 0.0)]),
        );
        let config = PipelineConfig {
            verify_timeout_secs: 1,
            verify_poll_secs: 1,
            ..PipelineConfig::default()
        };

        let pipeline = fixture.pipeline(vec![site], client, config);
        let result = pipeline.process(&fixture.local, false).await;
        assert!(matches!(result.outcome, RunOutcome::VerifyFailed { .. }));
    }

    #[tokio::test]
    async fn retry_reuses_stored_candidate() {
        let fixture = Fixture::new().await;
        let red = fixture.local.metainfo.with_source("RED");
        let red_hash = red.infohash().unwrap();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED").with_torrent(7, red.encode().unwrap()),
        );
        let client = Arc::new(
            client_with_local(&fixture)
                .with_statuses(red_hash, vec![(TorrentState::Seeding, 1.0)]),
        );

        let pipeline = fixture.pipeline(vec![site], client, Fixture::fast_config());
        let entry = RetryEntry {
            site_id: "redacted.sh".into(),
            remote_id: 7,
            local_infohash: fixture.local.infohash,
            local_name: "Album".into(),
            save_path: fixture.local.save_path.clone(),
            source_flag: "RED".into(),
            mapping: None,
            retry_count: 1,
            next_retry_at: Utc::now(),
        };

        let result = pipeline.process_retry(&fixture.local, &entry).await;
        assert!(matches!(result.outcome, RunOutcome::Matched { .. }));
    }
}
