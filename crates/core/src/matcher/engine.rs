//! The matching algorithm: pairing, piece verification, path decisions.

use std::collections::{HashMap, HashSet};

use crate::models::{CandidateTorrent, LocalTorrent};
use crate::normalize::{self, Profile};

use super::types::{
    FileAction, FileMapping, LinkingMode, MatchPolicy, MatchVerdict, RejectReason,
};

/// Minimum loose-basename similarity for disambiguating same-size files.
const NAME_SIMILARITY_THRESHOLD: f64 = 0.6;

/// Non-audio target files up to this size may be skipped outright.
const SKIP_MAX_BYTES: u64 = 1024 * 1024;

struct Entry {
    idx: usize,
    path: String,
    length: u64,
    offset: u64,
    depth: usize,
}

fn entries(paths: impl Iterator<Item = (String, u64, u64)>) -> Vec<Entry> {
    paths
        .enumerate()
        .map(|(idx, (path, length, offset))| {
            let depth = path.matches('/').count();
            Entry {
                idx,
                path,
                length,
                offset,
                depth,
            }
        })
        .collect()
}

/// Match a candidate against the local torrent under the given policy.
///
/// Deterministic: target files are processed in lexicographic order of their
/// strict-normalized path, and all ties resolve on declared order, so two
/// runs over the same inputs produce byte-identical mappings.
pub fn match_torrents(
    local: &LocalTorrent,
    candidate: &CandidateTorrent,
    policy: &MatchPolicy,
) -> MatchVerdict {
    let locals = entries(
        local
            .files()
            .iter()
            .enumerate()
            .map(|(i, f)| (local.full_path(i), f.length, f.offset)),
    );
    let targets = {
        let mut t = entries(
            candidate
                .files()
                .iter()
                .enumerate()
                .map(|(i, f)| (candidate.full_path(i), f.length, f.offset)),
        );
        t.sort_by(|a, b| {
            normalize::normalize_path(&a.path, Profile::Strict)
                .cmp(&normalize::normalize_path(&b.path, Profile::Strict))
        });
        t
    };

    // Phase 1: bipartite pairing by size, then by loose-name similarity.
    let mut by_size: HashMap<u64, Vec<usize>> = HashMap::new();
    for l in &locals {
        by_size.entry(l.length).or_default().push(l.idx);
    }

    let mut used_locals: HashSet<usize> = HashSet::new();
    // target idx (declared) -> local idx (declared)
    let mut paired: HashMap<usize, usize> = HashMap::new();

    for t in &targets {
        let Some(size_group) = by_size.get(&t.length) else {
            continue;
        };
        let free: Vec<usize> = size_group
            .iter()
            .copied()
            .filter(|i| !used_locals.contains(i))
            .collect();
        let chosen = match free.len() {
            0 => None,
            1 => Some(free[0]),
            _ => pick_by_similarity(&locals, &free, t),
        };
        if let Some(l_idx) = chosen {
            used_locals.insert(l_idx);
            paired.insert(t.idx, l_idx);
        }
    }

    if paired.is_empty() {
        return MatchVerdict::Rejected(RejectReason::SizeMismatch);
    }

    // Phase 2: conflict detection on leftover locals.
    let mut conflicted_targets: HashSet<usize> = HashSet::new();
    for l in &locals {
        if used_locals.contains(&l.idx) {
            continue;
        }
        let l_norm = normalize::normalize_path(&l.path, Profile::Loose);
        for t in &targets {
            if paired.contains_key(&t.idx) {
                continue;
            }
            if t.length != l.length
                && normalize::normalize_path(&t.path, Profile::Loose) == l_norm
            {
                if policy.linking_mode == LinkingMode::None {
                    return MatchVerdict::Rejected(RejectReason::Conflict);
                }
                conflicted_targets.insert(t.idx);
            }
        }
    }

    // Phase 3: piece verification. Hash-ladder hits share the local info
    // dictionary and need no re-check. When verification is skipped or a
    // boundary mismatch is tolerated, paired files must be reflinked even at
    // unchanged paths: the client may rewrite failed pieces into the copy,
    // and CoW keeps that divergence away from the original seed.
    let mut force_reflink = false;
    if !candidate.trusted {
        if local.piece_length() != candidate.metainfo.piece_length() {
            if !policy.allow_partial_pieces {
                return MatchVerdict::Rejected(RejectReason::PieceMismatch);
            }
            force_reflink = true;
        } else {
            match verify_pieces(local, candidate, &locals, &paired, policy) {
                Err(reason) => return MatchVerdict::Rejected(reason),
                Ok(tolerated) => force_reflink = tolerated,
            }
        }
    }

    // Phase 4: one action per target, budget accounting as we go.
    let mut actions = Vec::with_capacity(targets.len());
    let mut matched_bytes = 0u64;
    let mut unsatisfied_bytes = 0u64;

    for t in &targets {
        if let Some(&l_idx) = paired.get(&t.idx) {
            let l = &locals[l_idx];
            matched_bytes += t.length;
            let same_path = normalize::normalize_path(&l.path, Profile::Strict)
                == normalize::normalize_path(&t.path, Profile::Strict);
            let action = if force_reflink {
                FileAction::Link {
                    local: l.path.clone(),
                    target: t.path.clone(),
                    length: t.length,
                    mode: LinkingMode::Reflink,
                }
            } else if same_path {
                FileAction::Identical {
                    local: l.path.clone(),
                    target: t.path.clone(),
                    length: t.length,
                }
            } else if policy.allow_rename {
                FileAction::Rename {
                    local: l.path.clone(),
                    target: t.path.clone(),
                    length: t.length,
                }
            } else if policy.linking_mode != LinkingMode::None {
                FileAction::Link {
                    local: l.path.clone(),
                    target: t.path.clone(),
                    length: t.length,
                    mode: policy.linking_mode,
                }
            } else {
                return MatchVerdict::Rejected(RejectReason::LinkingRequiredDisabled);
            };
            actions.push(action);
        } else {
            unsatisfied_bytes += t.length;
            let skippable = !conflicted_targets.contains(&t.idx)
                && !normalize::is_audio(&t.path)
                && t.length <= SKIP_MAX_BYTES;
            actions.push(if skippable {
                FileAction::Skip {
                    target: t.path.clone(),
                    length: t.length,
                }
            } else {
                FileAction::Missing {
                    target: t.path.clone(),
                    length: t.length,
                }
            });
        }
    }

    if unsatisfied_bytes > policy.max_missing_bytes {
        return MatchVerdict::Rejected(RejectReason::TooMuchMissing);
    }

    MatchVerdict::Accepted(FileMapping {
        actions,
        matched_bytes,
        unsatisfied_bytes,
    })
}

/// Choose the best same-size local for a target file.
///
/// Eligible locals must clear the similarity threshold on loose-normalized
/// basenames; ties break on closest path depth, then declared order.
fn pick_by_similarity(locals: &[Entry], free: &[usize], target: &Entry) -> Option<usize> {
    let target_base = normalize::basename(&target.path);
    let mut best: Option<(f64, usize, usize)> = None;
    for &l_idx in free {
        let l = &locals[l_idx];
        let sim = normalize::similarity(normalize::basename(&l.path), target_base);
        if sim < NAME_SIMILARITY_THRESHOLD {
            continue;
        }
        let depth_diff = l.depth.abs_diff(target.depth);
        let better = match &best {
            None => true,
            Some((b_sim, b_depth, b_idx)) => {
                sim > *b_sim
                    || (sim == *b_sim && depth_diff < *b_depth)
                    || (sim == *b_sim && depth_diff == *b_depth && l_idx < *b_idx)
            }
        };
        if better {
            best = Some((sim, depth_diff, l_idx));
        }
    }
    best.map(|(_, _, idx)| idx)
}

/// Compare piece hashes where geometry allows it.
///
/// A candidate piece is comparable when every file contributing to it is
/// paired with an offset-aligned local file; comparable pieces must match,
/// except that a mismatching boundary piece is tolerated under
/// reflink + allow_partial_pieces. Returns whether any mismatch was
/// tolerated.
fn verify_pieces(
    local: &LocalTorrent,
    candidate: &CandidateTorrent,
    locals: &[Entry],
    paired: &HashMap<usize, usize>,
    policy: &MatchPolicy,
) -> Result<bool, RejectReason> {
    let local_pieces = local.metainfo.pieces();
    let cand_pieces = candidate.metainfo.pieces();

    // candidate piece index -> contributing candidate file indices
    let mut contributors: HashMap<usize, Vec<usize>> = HashMap::new();
    for (c_idx, _) in candidate.files().iter().enumerate() {
        for span in candidate.metainfo.pieces_for_file(c_idx) {
            contributors.entry(span.index).or_default().push(c_idx);
        }
    }

    let mut piece_indices: Vec<usize> = contributors.keys().copied().collect();
    piece_indices.sort_unstable();

    let mut any_tolerated = false;
    for piece in piece_indices {
        let files = &contributors[&piece];
        let comparable = files.iter().all(|c_idx| {
            paired.get(c_idx).is_some_and(|&l_idx| {
                locals[l_idx].offset == candidate.files()[*c_idx].offset
            })
        });
        if !comparable || piece >= local_pieces.len() {
            continue;
        }
        if cand_pieces[piece] != local_pieces[piece] {
            let boundary = files.len() > 1;
            let tolerated = boundary
                && policy.allow_partial_pieces
                && policy.linking_mode == LinkingMode::Reflink;
            if !tolerated {
                return Err(RejectReason::PieceMismatch);
            }
            any_tolerated = true;
        }
    }

    Ok(any_tolerated)
}
