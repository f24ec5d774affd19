//! Candidate search strategy.
//!
//! Runs the search ladder (hash, then filenames) against every enabled
//! target site in parallel, deduplicates the hits and ranks them for the
//! pipeline. The first rung that lands a hash hit short-circuits the rest
//! of that site's ladder with a trusted pairing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::metainfo::InfoHash;
use crate::models::{CandidateOrigin, CandidateRef, LocalTorrent};
use crate::normalize::{self, Profile};
use crate::sites::{source_flag_aliases, SiteError, TrackerSite};

/// Bracketed tags (year, codec, source) stripped from name queries.
static BRACKET_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}").expect("valid regex"));

/// Extensions worth a dedicated filename-ladder rung.
const LADDER_EXTENSIONS: [&str; 5] = ["flac", "mp3", "dsf", "dff", "m4a"];

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Candidates retained per site from the name ladder.
    pub max_candidates_per_site: usize,
    /// A single query returning more raw hits than this is too ambiguous.
    pub max_raw_results: usize,
    /// Per-site deadline for the whole ladder.
    pub site_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_candidates_per_site: 25,
            max_raw_results: 20,
            site_timeout_secs: 15,
        }
    }
}

/// Aggregated result of one search round.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// Deduplicated candidates in rank order.
    pub candidates: Vec<CandidateRef>,
    /// Sites whose credentials were rejected; disable them for the run.
    pub auth_failures: Vec<String>,
}

/// Search every site in parallel and merge the ranked results.
pub async fn find_candidates(
    local: &LocalTorrent,
    sites: &[Arc<dyn TrackerSite>],
    config: &SearchConfig,
) -> SearchOutcome {
    let futures = sites.iter().map(|site| {
        let site = Arc::clone(site);
        async move {
            let deadline = Duration::from_secs(config.site_timeout_secs);
            match tokio::time::timeout(deadline, search_site(local, site.as_ref(), config)).await {
                Ok(result) => (site.site_id().to_string(), result),
                Err(_) => {
                    warn!("search timed out on {}", site.site_id());
                    (site.site_id().to_string(), Ok(Vec::new()))
                }
            }
        }
    });

    let mut outcome = SearchOutcome::default();
    let mut seen: HashSet<(String, i64)> = HashSet::new();

    for (site_id, result) in futures::future::join_all(futures).await {
        match result {
            Ok(candidates) => {
                for c in candidates {
                    if seen.insert((c.site_id.clone(), c.remote_id)) {
                        outcome.candidates.push(c);
                    }
                }
            }
            Err(SiteError::Auth(reason)) => {
                warn!("disabling {} for this run: {}", site_id, reason);
                outcome.auth_failures.push(site_id);
            }
            Err(e) => warn!("search failed on {}: {}", site_id, e),
        }
    }

    rank(&mut outcome.candidates);
    outcome
}

/// Hash hits first, then name hits by similarity to the local name;
/// lexicographic (site, id) settles the rest.
fn rank(candidates: &mut [CandidateRef]) {
    let score = |c: &CandidateRef| match &c.origin {
        CandidateOrigin::HashHit { .. } => f64::INFINITY,
        CandidateOrigin::NameHit { similarity } => *similarity,
    };
    candidates.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.site_id.cmp(&b.site_id))
            .then_with(|| a.remote_id.cmp(&b.remote_id))
    });
}

/// Run the full ladder against one site.
async fn search_site(
    local: &LocalTorrent,
    site: &dyn TrackerSite,
    config: &SearchConfig,
) -> Result<Vec<CandidateRef>, SiteError> {
    if let Some(hit) = hash_ladder(local, site).await? {
        info!("hash hit on {}: torrent {}", site.site_id(), hit.remote_id);
        return Ok(vec![hit]);
    }
    name_ladder(local, site, config).await
}

/// Try the local infohash, then the hash the torrent would have under the
/// site's source flag, its historical aliases, and no flag at all.
async fn hash_ladder(
    local: &LocalTorrent,
    site: &dyn TrackerSite,
) -> Result<Option<CandidateRef>, SiteError> {
    let mut hashes: Vec<InfoHash> = vec![local.infohash];
    let mut flags: Vec<&str> = vec![site.source_flag()];
    flags.extend(source_flag_aliases(site.source_flag()));
    flags.push("");

    for flag in flags {
        if let Ok(hash) = local.metainfo.with_source(flag).infohash() {
            if !hashes.contains(&hash) {
                hashes.push(hash);
            }
        }
    }

    for hash in hashes {
        match site.search_by_hash(&hash).await? {
            Some(remote) => {
                return Ok(Some(CandidateRef {
                    site_id: site.site_id().to_string(),
                    remote_id: remote.remote_id,
                    title: remote.title,
                    size: remote.size,
                    origin: CandidateOrigin::HashHit { infohash: hash },
                }));
            }
            None => debug!("no hash hit for {} on {}", hash, site.site_id()),
        }
    }
    Ok(None)
}

/// Filename search: the cleaned top-level name, then the longest filenames
/// with music extensions prioritized, each with a sanitized fallback.
async fn name_ladder(
    local: &LocalTorrent,
    site: &dyn TrackerSite,
    config: &SearchConfig,
) -> Result<Vec<CandidateRef>, SiteError> {
    let mut candidates = Vec::new();
    let mut seen: HashSet<i64> = HashSet::new();

    for query in build_queries(local) {
        let mut hits = site.search_by_filename(&query).await?;

        // Music files that find nothing get one sanitized retry.
        if hits.is_empty() {
            let cleaned = normalize::search_query(&query);
            if cleaned != query && !cleaned.is_empty() {
                debug!("retrying with sanitized query: {}", cleaned);
                hits = site.search_by_filename(&cleaned).await?;
            }
        }

        if hits.len() > config.max_raw_results {
            debug!(
                "query '{}' on {} too ambiguous ({} hits), skipping",
                query,
                site.site_id(),
                hits.len()
            );
            continue;
        }

        let local_size = local.total_size();
        for hit in hits {
            if !seen.insert(hit.remote_id) {
                continue;
            }
            // An exact total-size match outranks any name similarity.
            let mut similarity = if hit.size == Some(local_size) {
                1.0
            } else {
                hit.title
                    .as_deref()
                    .map(|t| normalize::similarity(t, local.name()))
                    .unwrap_or(0.5)
            };
            // Without a total-size match, a per-file listing settles what a
            // title cannot, before any download token is spent.
            if hit.size != Some(local_size) {
                match site.fetch_file_list(hit.remote_id).await {
                    Ok(files) if !files.is_empty() => {
                        match check_file_content(local, &query, &files) {
                            ContentCheck::Conflict => {
                                debug!(
                                    "dropping {} torrent {}: conflicting file list",
                                    site.site_id(),
                                    hit.remote_id
                                );
                                continue;
                            }
                            ContentCheck::Match => similarity = 1.0,
                            ContentCheck::Inconclusive => {}
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(
                        "file list for {} torrent {} unavailable: {}",
                        site.site_id(),
                        hit.remote_id,
                        e
                    ),
                }
            }
            candidates.push(CandidateRef {
                site_id: site.site_id().to_string(),
                remote_id: hit.remote_id,
                title: hit.title,
                size: hit.size,
                origin: CandidateOrigin::NameHit { similarity },
            });
            if candidates.len() >= config.max_candidates_per_site {
                return Ok(candidates);
            }
        }

        if !candidates.is_empty() {
            // A productive rung ends the ladder.
            break;
        }
    }

    Ok(candidates)
}

/// Verdict of a remote file-list inspection.
enum ContentCheck {
    /// A listed file carries every query word at a size the local torrent
    /// holds.
    Match,
    /// A listed audio file shares a name with a local file at a different
    /// size.
    Conflict,
    Inconclusive,
}

/// Pre-rank a name-ladder hit by its remote file list. The conflict veto
/// only fires for audio: non-audio drift (artwork, logs) is the matcher's
/// demotion case, not a disqualifier.
fn check_file_content(
    local: &LocalTorrent,
    query: &str,
    files: &HashMap<String, u64>,
) -> ContentCheck {
    for (name, size) in files {
        if !normalize::is_audio(name) {
            continue;
        }
        let name_loose = normalize::normalize_path(name, Profile::Loose);
        let conflicted = local.files().iter().any(|f| {
            f.length != *size && normalize::normalize_path(&f.path, Profile::Loose) == name_loose
        });
        if conflicted {
            return ContentCheck::Conflict;
        }
    }

    let query_loose = normalize::normalize(query, Profile::Loose);
    let words: Vec<&str> = query_loose.split(' ').filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return ContentCheck::Inconclusive;
    }
    for (name, size) in files {
        let name_loose = normalize::normalize_path(name, Profile::Loose);
        if words.iter().all(|w| name_loose.contains(w))
            && local.files().iter().any(|f| f.length == *size)
        {
            return ContentCheck::Match;
        }
    }
    ContentCheck::Inconclusive
}

/// Queries in ladder order: cleaned torrent name, then up to five of the
/// longest filenames (the first unconditionally, the rest only for music
/// extensions).
fn build_queries(local: &LocalTorrent) -> Vec<String> {
    let mut queries = Vec::new();

    let stripped = BRACKET_TAG_RE.replace_all(local.name(), " ");
    let name_query = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if !name_query.is_empty() {
        queries.push(name_query);
    }

    let mut names: Vec<&str> = local.files().iter().map(|f| f.path.as_str()).collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut file_queries = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let ext = normalize::extension(name);
        if i == 0 || LADDER_EXTENSIONS.iter().any(|e| *e == ext) {
            let base = normalize::basename(name).to_string();
            if !queries.contains(&base) && !file_queries.contains(&base) {
                file_queries.push(base);
            }
        }
        if file_queries.len() >= 5 {
            break;
        }
    }
    queries.extend(file_queries);
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::RemoteTorrent;
    use crate::testing::{MockSite, TorrentBuilder};

    fn local() -> LocalTorrent {
        let meta = TorrentBuilder::new("Artist - Album (2020) [FLAC]", 16384)
            .file("01 - A Fairly Long Track Title.flac", 30_000_000)
            .file("02 - Short.flac", 20_000_000)
            .file("cover.jpg", 500_000)
            .build();
        LocalTorrent {
            infohash: meta.infohash().unwrap(),
            save_path: "/data".into(),
            trackers: vec!["https://flacsfor.me/announce".into()],
            metainfo: meta,
        }
    }

    #[test]
    fn queries_strip_tags_and_prefer_long_music_names() {
        let queries = build_queries(&local());
        assert_eq!(queries[0], "Artist - Album");
        assert_eq!(queries[1], "01 - A Fairly Long Track Title.flac");
        // cover.jpg is the shortest and not music; it only appears if it
        // were the single longest name.
        assert!(!queries.iter().any(|q| q.contains("cover")));
    }

    #[tokio::test]
    async fn hash_hit_short_circuits_name_ladder() {
        let l = local();
        let red_hash = l.metainfo.with_source("RED").infohash().unwrap();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("redacted.sh", "flacsfor.me", "RED").with_hash_hit(
                red_hash,
                RemoteTorrent {
                    remote_id: 777,
                    title: Some("Album".into()),
                    size: Some(l.total_size()),
                },
            ),
        );

        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.remote_id, 777);
        assert!(c.is_hash_hit());
        match &c.origin {
            CandidateOrigin::HashHit { infohash } => assert_eq!(*infohash, red_hash),
            _ => panic!("expected hash hit"),
        }
    }

    #[tokio::test]
    async fn name_hits_rank_by_similarity_after_hash_hits() {
        let l = local();
        let site_a: Arc<dyn TrackerSite> =
            Arc::new(MockSite::new("a.example", "a.tracker", "AAA").with_name_hits(vec![
                RemoteTorrent {
                    remote_id: 1,
                    title: Some("Completely Different Thing".into()),
                    size: Some(1),
                },
                RemoteTorrent {
                    remote_id: 2,
                    title: Some("Artist - Album (2020) [FLAC]".into()),
                    size: Some(2),
                },
            ]));
        let site_b: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("b.example", "b.tracker", "BBB").with_hash_hit(
                l.metainfo.with_source("BBB").infohash().unwrap(),
                RemoteTorrent {
                    remote_id: 9,
                    title: None,
                    size: None,
                },
            ),
        );

        let outcome = find_candidates(&l, &[site_a, site_b], &SearchConfig::default()).await;
        assert!(outcome.candidates.len() >= 3);
        assert!(outcome.candidates[0].is_hash_hit());
        assert_eq!(outcome.candidates[1].remote_id, 2);
        assert_eq!(outcome.candidates[2].remote_id, 1);
    }

    #[tokio::test]
    async fn auth_failure_reports_site_for_disabling() {
        let l = local();
        let site: Arc<dyn TrackerSite> =
            Arc::new(MockSite::new("a.example", "a.tracker", "AAA").with_auth_failure());
        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.auth_failures, vec!["a.example".to_string()]);
    }

    #[tokio::test]
    async fn ambiguous_queries_are_skipped() {
        let l = local();
        let many: Vec<RemoteTorrent> = (0..30)
            .map(|i| RemoteTorrent {
                remote_id: i,
                title: Some("x".into()),
                size: Some(1),
            })
            .collect();
        let site: Arc<dyn TrackerSite> =
            Arc::new(MockSite::new("a.example", "a.tracker", "AAA").with_name_hits(many));
        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert!(outcome.candidates.is_empty());
    }

    #[tokio::test]
    async fn conflicting_remote_file_list_drops_the_candidate() {
        let l = local();
        // The remote lists the same track name at a different size.
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("a.example", "a.tracker", "AAA")
                .with_name_hits(vec![RemoteTorrent {
                    remote_id: 3,
                    title: Some("Artist - Album".into()),
                    size: Some(999),
                }])
                .with_file_list(3, &[("01 - A Fairly Long Track Title.flac", 123)]),
        );
        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert!(outcome.candidates.is_empty());
    }

    #[tokio::test]
    async fn remote_file_list_content_hit_outranks_title_similarity() {
        let l = local();
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("a.example", "a.tracker", "AAA")
                .with_name_hits(vec![
                    RemoteTorrent {
                        remote_id: 1,
                        title: Some("Artist - Anthology".into()),
                        size: Some(999),
                    },
                    RemoteTorrent {
                        remote_id: 2,
                        title: Some("something unrelated".into()),
                        size: Some(998),
                    },
                ])
                // Remote 2 lists a file carrying the queried words at the
                // local file's exact size.
                .with_file_list(2, &[("Artist - Album/01 - cover edition.jpg", 500_000)]),
        );
        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert_eq!(outcome.candidates.len(), 2);
        // Remote 1's title is closer, but remote 2's content hit pins it
        // at full similarity and it ranks first.
        assert_eq!(outcome.candidates[0].remote_id, 2);
        match &outcome.candidates[0].origin {
            CandidateOrigin::NameHit { similarity } => assert_eq!(*similarity, 1.0),
            other => panic!("expected name hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_audio_size_drift_is_not_a_search_conflict() {
        let l = local();
        // Same cover name, different size: the matcher demotes this later,
        // the search must not veto it.
        let site: Arc<dyn TrackerSite> = Arc::new(
            MockSite::new("a.example", "a.tracker", "AAA")
                .with_name_hits(vec![RemoteTorrent {
                    remote_id: 4,
                    title: Some("Artist - Album".into()),
                    size: Some(999),
                }])
                .with_file_list(4, &[("cover.jpg", 2_000_000)]),
        );
        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[tokio::test]
    async fn exact_size_match_ranks_first_among_name_hits() {
        let l = local();
        let site: Arc<dyn TrackerSite> =
            Arc::new(MockSite::new("a.example", "a.tracker", "AAA").with_name_hits(vec![
                RemoteTorrent {
                    remote_id: 1,
                    title: Some("Artist - Album".into()),
                    size: Some(123),
                },
                RemoteTorrent {
                    remote_id: 2,
                    title: Some("unrelated title".into()),
                    size: Some(l.total_size()),
                },
            ]));
        let outcome = find_candidates(&l, &[site], &SearchConfig::default()).await;
        assert_eq!(outcome.candidates[0].remote_id, 2);
    }
}
