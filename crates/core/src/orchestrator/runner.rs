//! The orchestrator: mode entry points and background loops.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::TorrentInfoCache;
use crate::client::TorrentClient;
use crate::ledger::{LedgerHandle, LedgerStore, RetryEntry};
use crate::metainfo::InfoHash;
use crate::models::LocalTorrent;
use crate::pipeline::{MatchPipeline, PipelineRunResult, RunOutcome};

use super::types::{AnnounceRequest, OrchestratorError, ScanSummary};
use super::OrchestratorConfig;

/// Retry entries pulled per sweep.
const RETRY_SWEEP_LIMIT: usize = 50;

/// Drives pipelines across all modes with bounded concurrency.
pub struct Orchestrator {
    config: OrchestratorConfig,
    cache: Arc<TorrentInfoCache>,
    client: Arc<dyn TorrentClient>,
    pipeline: Arc<MatchPipeline>,
    ledger: LedgerHandle,
    store: Arc<dyn LedgerStore>,

    scan_semaphore: Arc<Semaphore>,
    /// Hashes with a pipeline in progress; a hash never runs twice at once.
    in_flight: Arc<Mutex<HashSet<InfoHash>>>,
    /// Advisory locks per save path, held across reconciliation so two
    /// pipelines never mutate the same local files concurrently.
    path_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,

    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Removes the hash from the in-flight set when the pipeline finishes.
#[derive(Debug)]
struct InFlightGuard {
    set: Arc<Mutex<HashSet<InfoHash>>>,
    hash: InfoHash,
}

impl InFlightGuard {
    fn acquire(
        set: &Arc<Mutex<HashSet<InfoHash>>>,
        hash: InfoHash,
    ) -> Result<Self, OrchestratorError> {
        let mut guard = set.lock().unwrap();
        if !guard.insert(hash) {
            return Err(OrchestratorError::Busy(hash));
        }
        Ok(Self {
            set: Arc::clone(set),
            hash,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.hash);
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        cache: Arc<TorrentInfoCache>,
        client: Arc<dyn TorrentClient>,
        pipeline: Arc<MatchPipeline>,
        ledger: LedgerHandle,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let scan_semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            cache,
            client,
            pipeline,
            ledger,
            store,
            scan_semaphore,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            path_locks: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    fn path_lock(&self, save_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.path_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(save_path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Run one pipeline with all shared-state discipline applied.
    async fn run_guarded(
        &self,
        local: &LocalTorrent,
        force: bool,
    ) -> Result<PipelineRunResult, OrchestratorError> {
        let _in_flight = InFlightGuard::acquire(&self.in_flight, local.infohash)?;
        let lock = self.path_lock(&local.save_path);
        let _path_guard = lock.lock().await;
        Ok(self.pipeline.process(local, force).await)
    }

    /// Full scan: every cached torrent passing the allow-list, with bounded
    /// global concurrency.
    pub async fn full_scan(&self, force: bool) -> Result<ScanSummary, OrchestratorError> {
        info!("starting full scan");
        self.cache.refresh(self.client.as_ref(), force).await?;
        let hashes = self.cache.all_filtered(&self.config.check_trackers)?;
        info!("{} torrents eligible for scanning", hashes.len());

        let mut summary = ScanSummary::default();
        let mut tasks: JoinSet<Option<PipelineRunResult>> = JoinSet::new();

        for hash in hashes {
            let semaphore = Arc::clone(&self.scan_semaphore);
            let cache = Arc::clone(&self.cache);
            let pipeline = Arc::clone(&self.pipeline);
            let in_flight = Arc::clone(&self.in_flight);
            let path_locks = Arc::clone(&self.path_locks);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if shutdown_rx.try_recv().is_ok() {
                    return None;
                }
                let local = match cache.get(&hash) {
                    Ok(Some(local)) => local,
                    Ok(None) => return None,
                    Err(e) => {
                        warn!("cache read failed for {}: {}", hash, e);
                        return None;
                    }
                };
                let _guard = InFlightGuard::acquire(&in_flight, hash).ok()?;
                let lock = {
                    let mut locks = path_locks.lock().unwrap();
                    Arc::clone(
                        locks
                            .entry(local.save_path.clone())
                            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
                    )
                };
                let _path_guard = lock.lock().await;
                Some(pipeline.process(&local, force).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => {
                    summary.scanned += 1;
                    match &result.outcome {
                        RunOutcome::Matched { .. } => summary.matched += 1,
                        RunOutcome::Skipped { .. } => summary.skipped += 1,
                        RunOutcome::NoMatch { .. } => summary.no_match += 1,
                        _ => summary.failed += 1,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // A panicking pipeline must not take down the scan.
                    error!("pipeline task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "full scan complete: {} scanned, {} matched, {} skipped, {} no match, {} failed",
            summary.scanned, summary.matched, summary.skipped, summary.no_match, summary.failed
        );
        Ok(summary)
    }

    /// Single-hash mode.
    pub async fn process_single(
        &self,
        hash: InfoHash,
        force: bool,
    ) -> Result<PipelineRunResult, OrchestratorError> {
        let local = match self.cache.get(&hash)? {
            Some(local) => local,
            None => {
                // The torrent may have been added since the last poll.
                self.cache.refresh(self.client.as_ref(), false).await?;
                self.cache
                    .get(&hash)?
                    .ok_or(OrchestratorError::UnknownHash(hash))?
            }
        };
        self.run_guarded(&local, force).await
    }

    /// Announce mode: resolve the webhook payload to a cached torrent and
    /// run its pipeline within the announce deadline.
    pub async fn process_announce(
        &self,
        request: AnnounceRequest,
    ) -> Result<PipelineRunResult, OrchestratorError> {
        let deadline = Duration::from_secs(self.config.announce_timeout_secs);
        tokio::time::timeout(deadline, self.announce_inner(request))
            .await
            .map_err(|_| OrchestratorError::Timeout)?
    }

    async fn announce_inner(
        &self,
        request: AnnounceRequest,
    ) -> Result<PipelineRunResult, OrchestratorError> {
        let hash = match request.info_hash {
            Some(hash) if self.cache.get(&hash)?.is_some() => Some(hash),
            Some(hash) => {
                debug!("announce hash {} unknown, trying name resolution", hash);
                None
            }
            None => None,
        };
        let hash = match hash {
            Some(hash) => hash,
            None => match &request.name {
                Some(name) => self
                    .cache
                    .by_name(name, request.size)
                    .ok_or(OrchestratorError::Unresolvable)?,
                None => {
                    return Err(request
                        .info_hash
                        .map(OrchestratorError::UnknownHash)
                        .unwrap_or(OrchestratorError::Unresolvable))
                }
            },
        };

        let local = self
            .cache
            .get(&hash)?
            .ok_or(OrchestratorError::UnknownHash(hash))?;
        self.run_guarded(&local, true).await
    }

    /// Retry mode: replay due ledger entries, skipping search.
    pub async fn retry_sweep(&self) -> Result<usize, OrchestratorError> {
        let due = self.store.due_retries(Utc::now(), RETRY_SWEEP_LIMIT)?;
        if due.is_empty() {
            return Ok(0);
        }
        info!("retry sweep: {} entries due", due.len());

        // A cold cache would make every local torrent look gone.
        if let Err(e) = self.cache.refresh(self.client.as_ref(), false).await {
            warn!("cache refresh before retry sweep failed: {}", e);
        }

        let mut processed = 0;
        for entry in due {
            let Some(local) = self.cache.get(&entry.local_infohash)? else {
                debug!(
                    "local torrent {} gone, dropping retry entry",
                    entry.local_infohash
                );
                self.ledger
                    .remove_retry(&entry.site_id, entry.remote_id)
                    .await;
                continue;
            };

            let _in_flight = match InFlightGuard::acquire(&self.in_flight, local.infohash) {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            let lock = self.path_lock(&local.save_path);
            let _path_guard = lock.lock().await;

            let result = self.pipeline.process_retry(&local, &entry).await;
            processed += 1;
            self.settle_retry(&entry, &result).await;
        }
        Ok(processed)
    }

    async fn settle_retry(&self, entry: &RetryEntry, result: &PipelineRunResult) {
        match &result.outcome {
            // Success removes the entry inside the pipeline.
            RunOutcome::Matched { .. } => {}
            RunOutcome::NoMatch { .. } => {
                // The stored candidate no longer matches; stop retrying.
                self.ledger
                    .remove_retry(&entry.site_id, entry.remote_id)
                    .await;
            }
            RunOutcome::DownloadFailed { .. } => {
                let attempts = entry.retry_count + 1;
                if attempts >= self.config.retry_max_attempts {
                    warn!(
                        "retry for {} torrent {} permanently failed after {} attempts",
                        entry.site_id, entry.remote_id, attempts
                    );
                    self.ledger
                        .bump_retry(&entry.site_id, entry.remote_id, attempts, None)
                        .await;
                } else {
                    let delay = self.backoff(attempts);
                    self.ledger
                        .bump_retry(
                            &entry.site_id,
                            entry.remote_id,
                            attempts,
                            Some(Utc::now() + chrono::Duration::seconds(delay as i64)),
                        )
                        .await;
                }
            }
            // Verify failures need an operator; inject failures were
            // filesystem-level. Neither retries automatically.
            _ => {
                self.ledger
                    .bump_retry(&entry.site_id, entry.remote_id, entry.retry_count, None)
                    .await;
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff(&self, attempt: u32) -> u64 {
        let base = self.config.retry_base_delay_secs.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..base);
        exp.saturating_add(jitter).min(self.config.retry_max_delay_secs)
    }

    /// Spawn the background loops: cache polling, scheduled scans, retry
    /// sweeps.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("orchestrator already running");
            return;
        }
        info!("starting orchestrator loops");

        self.spawn_cache_poll_loop();
        if self.config.search_cadence_secs.is_some() {
            self.spawn_scan_loop();
        }
        if self.config.retry_cadence_secs.is_some() {
            self.spawn_retry_loop();
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping orchestrator");
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_cache_poll_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let interval = Duration::from_secs(this.config.cache_poll_secs.max(10));
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = this.cache.refresh(this.client.as_ref(), false).await {
                            warn!("cache poll failed: {}", e);
                        }
                    }
                }
            }
            debug!("cache poll loop stopped");
        });
    }

    fn spawn_scan_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let cadence = this.config.search_cadence_secs.unwrap_or(0).max(60);
            let interval = Duration::from_secs(cadence);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = this.full_scan(false).await {
                            warn!("scheduled scan failed: {}", e);
                        }
                    }
                }
            }
            debug!("scan loop stopped");
        });
    }

    fn spawn_retry_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let cadence = this.config.retry_cadence_secs.unwrap_or(0).max(60);
            let interval = Duration::from_secs(cadence);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = this.retry_sweep().await {
                            warn!("retry sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("retry loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientTorrentInfo, TorrentState};
    use crate::ledger::{create_ledger, SqliteLedgerStore};
    use crate::pipeline::{JobRegistry, PipelineConfig};
    use crate::reconcile::FsReconciler;
    use crate::sites::{RemoteTorrent, TrackerSite};
    use crate::testing::{MockClient, MockSite, TorrentBuilder};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        orchestrator: Arc<Orchestrator>,
        store: Arc<SqliteLedgerStore>,
        local_hash: InfoHash,
        _writer: tokio::task::JoinHandle<()>,
    }

    async fn fixture(sites: Vec<Arc<dyn TrackerSite>>) -> Fixture {
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
        let hash = meta.infohash().unwrap();
        let client: Arc<dyn TorrentClient> = Arc::new(
            MockClient::new()
                .with_torrent(
                    ClientTorrentInfo {
                        hash,
                        name: "Album".into(),
                        save_path: root.to_string_lossy().to_string(),
                        state: TorrentState::Seeding,
                        progress: 1.0,
                        total_size: 30000,
                        trackers: vec!["https://flacsfor.me/announce".into()],
                        label: None,
                    },
                    meta.encode().unwrap(),
                )
                .with_statuses(
                    meta.with_source("RED").infohash().unwrap(),
                    vec![(TorrentState::Seeding, 1.0)],
                ),
        );

        let cache = Arc::new(crate::cache::TorrentInfoCache::in_memory().unwrap());
        let store = Arc::new(SqliteLedgerStore::in_memory().unwrap());
        let (ledger, writer) = create_ledger(store.clone(), 64);
        let writer = tokio::spawn(writer.run());

        let pipeline = Arc::new(MatchPipeline::new(
            sites,
            Arc::clone(&client),
            Arc::new(FsReconciler::new()),
            ledger.clone(),
            store.clone(),
            Arc::new(JobRegistry::new()),
            PipelineConfig {
                verify_timeout_secs: 5,
                verify_poll_secs: 1,
                ..PipelineConfig::default()
            },
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                retry_base_delay_secs: 10,
                ..OrchestratorConfig::default()
            },
            cache,
            client,
            pipeline,
            ledger,
            store.clone(),
        ));

        Fixture {
            _temp: temp,
            orchestrator,
            store,
            local_hash: hash,
            _writer: writer,
        }
    }

    fn red_site(local_meta_name: &str) -> (Arc<dyn TrackerSite>, InfoHash) {
        let meta = TorrentBuilder::new(local_meta_name, 16384)
            .file("01.flac", 30000)
            .announce("https://flacsfor.me/announce")
            .build();
        let red = meta.with_source("RED");
        let red_hash = red.infohash().unwrap();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "red.tracker", "RED")
                .with_hash_hit(
                    red_hash,
                    RemoteTorrent {
                        remote_id: 1,
                        title: None,
                        size: Some(30000),
                    },
                )
                .with_torrent(1, red.encode().unwrap()),
        );
        (site, red_hash)
    }

    #[tokio::test]
    async fn full_scan_processes_cached_torrents() {
        let (site, _) = red_site("Album");
        let f = fixture(vec![site]).await;

        let summary = f.orchestrator.full_scan(false).await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.matched, 1);

        // A second scan skips the now-seen hash.
        let summary = f.orchestrator.full_scan(false).await.unwrap();
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn single_mode_reports_unknown_hashes() {
        let f = fixture(vec![]).await;
        let missing = InfoHash([9u8; 20]);
        let err = f.orchestrator.process_single(missing, true).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownHash(h) if h == missing));
    }

    #[tokio::test]
    async fn announce_resolves_by_hash_and_name() {
        let (site, _) = red_site("Album");
        let f = fixture(vec![site]).await;
        // Populate the cache.
        f.orchestrator.full_scan(false).await.unwrap();

        // By name + size, with zero-width drift in the announce payload.
        let result = f
            .orchestrator
            .process_announce(AnnounceRequest {
                info_hash: None,
                name: Some("Al\u{200B}bum".into()),
                size: Some(30000),
            })
            .await
            .unwrap();
        assert_eq!(result.infohash, f.local_hash);

        // By hash.
        let result = f
            .orchestrator
            .process_announce(AnnounceRequest {
                info_hash: Some(f.local_hash),
                name: None,
                size: None,
            })
            .await
            .unwrap();
        assert_eq!(result.infohash, f.local_hash);

        // Unresolvable payloads are an explicit error.
        let err = f
            .orchestrator
            .process_announce(AnnounceRequest {
                info_hash: None,
                name: Some("nothing like it".into()),
                size: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Unresolvable));
    }

    #[tokio::test]
    async fn retry_sweep_applies_backoff_and_caps_attempts() {
        // A site that keeps failing the fetch.
        let site: Arc<dyn TrackerSite> =
            Arc::new(MockSite::new("redacted.sh", "red.tracker", "RED").with_fetch_failure());
        let f = fixture(vec![site]).await;
        f.orchestrator.full_scan(false).await.unwrap();

        f.store
            .upsert_retry(&RetryEntry {
                site_id: "redacted.sh".into(),
                remote_id: 7,
                local_infohash: f.local_hash,
                local_name: "Album".into(),
                save_path: "/data".into(),
                source_flag: "RED".into(),
                mapping: None,
                retry_count: 0,
                next_retry_at: Utc::now(),
            })
            .unwrap();

        let processed = f.orchestrator.retry_sweep().await.unwrap();
        assert_eq!(processed, 1);

        // Backed off into the future: nothing due now.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.store.due_retries(Utc::now(), 10).unwrap().is_empty());

        // Drive the entry to the attempt cap; it ends up parked.
        for _ in 0..10 {
            let due = f
                .store
                .due_retries(Utc::now() + chrono::Duration::days(365), 10)
                .unwrap();
            let Some(entry) = due.first() else { break };
            if entry.retry_count >= 5 {
                break;
            }
            f.store
                .bump_retry("redacted.sh", 7, entry.retry_count, Some(Utc::now()))
                .unwrap();
            f.orchestrator.retry_sweep().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let parked = f
            .store
            .due_retries(Utc::now() + chrono::Duration::days(365 * 100), 10)
            .unwrap();
        assert!(parked.is_empty() || parked[0].retry_count >= 5);
    }

    #[tokio::test]
    async fn busy_hashes_are_rejected() {
        let f = fixture(vec![]).await;
        let guard = InFlightGuard::acquire(&f.orchestrator.in_flight, f.local_hash).unwrap();
        let err = InFlightGuard::acquire(&f.orchestrator.in_flight, f.local_hash).unwrap_err();
        assert!(matches!(err, OrchestratorError::Busy(_)));
        drop(guard);
        assert!(InFlightGuard::acquire(&f.orchestrator.in_flight, f.local_hash).is_ok());
    }
}
