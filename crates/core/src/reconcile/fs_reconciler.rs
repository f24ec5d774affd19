//! Filesystem reconciler implementation.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::matcher::{FileAction, LinkingMode};

use super::types::{ReconcileJob, ReconcileReport, RollbackPlan};
use super::{ReconcileError, Reconciler};

/// Reconciler that works directly against the local filesystem.
pub struct FsReconciler;

impl FsReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Attempts an atomic rename, reporting cross-device failures.
    async fn try_atomic_move(source: &Path, destination: &Path) -> Result<bool, std::io::Error> {
        match fs::rename(source, destination).await {
            Ok(()) => Ok(true),
            Err(e) => {
                if e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Materialize `destination` from `source` starting at the requested
    /// link mode. Degradation order is fixed: hard -> sym -> reflink; the
    /// reflink step fails hard when unsupported.
    async fn link_chain(
        source: &Path,
        destination: &Path,
        mode: LinkingMode,
    ) -> Result<(), ReconcileError> {
        let mut last_err = String::new();

        if mode == LinkingMode::Hard {
            match fs::hard_link(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("hardlink {} failed: {}", destination.display(), e);
                    last_err = e.to_string();
                }
            }
        }

        if matches!(mode, LinkingMode::Hard | LinkingMode::Sym) {
            // Symlinks must point at an absolute path to survive the
            // staging-root swap.
            match fs::canonicalize(source).await {
                Ok(abs) => {
                    #[cfg(unix)]
                    match fs::symlink(&abs, destination).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            debug!("symlink {} failed: {}", destination.display(), e);
                            last_err = e.to_string();
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = abs;
                    }
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        let src = source.to_path_buf();
        let dst = destination.to_path_buf();
        let reflinked =
            tokio::task::spawn_blocking(move || reflink_copy::reflink(&src, &dst)).await;
        match reflinked {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ReconcileError::LinkFailed {
                path: destination.to_path_buf(),
                detail: if last_err.is_empty() {
                    e.to_string()
                } else {
                    format!("{} (after: {})", e, last_err)
                },
            }),
            Err(e) => Err(ReconcileError::LinkFailed {
                path: destination.to_path_buf(),
                detail: e.to_string(),
            }),
        }
    }

    async fn ensure_parent_dirs(
        path: &Path,
        plan: &mut RollbackPlan,
    ) -> Result<(), ReconcileError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() || parent.exists() {
            return Ok(());
        }
        let mut missing = Vec::new();
        let mut current = parent;
        while !current.exists() {
            missing.push(current.to_path_buf());
            current = match current.parent() {
                Some(p) => p,
                None => break,
            };
        }
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ReconcileError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        for dir in missing.into_iter().rev() {
            plan.record_dir(dir);
        }
        Ok(())
    }

    /// Path of `target` relative to the target's top-level name. Empty for
    /// a single-file target, where the root itself is the file.
    fn target_rel<'a>(target: &'a str, target_name: &str) -> Result<&'a str, ReconcileError> {
        if target == target_name {
            Ok("")
        } else {
            target
                .strip_prefix(target_name)
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(|| {
                    ReconcileError::UnsupportedAction(format!(
                        "target path {} outside root {}",
                        target, target_name
                    ))
                })
        }
    }

    /// True when every satisfiable target file already exists at its final
    /// path with the declared length.
    async fn already_satisfied(job: &ReconcileJob) -> bool {
        for action in &job.mapping.actions {
            if action.is_unsatisfied() {
                continue;
            }
            let path = job.target_root.join(action.target());
            match fs::metadata(&path).await {
                Ok(meta) if meta.len() == action.length() => {}
                _ => return false,
            }
        }
        true
    }

    async fn verify_length(path: &Path, expected: u64) -> Result<(), ReconcileError> {
        let meta = fs::metadata(path).await?;
        if meta.len() != expected {
            return Err(ReconcileError::LengthMismatch {
                path: path.to_path_buf(),
                expected,
                actual: meta.len(),
            });
        }
        Ok(())
    }

    async fn execute_action(
        job: &ReconcileJob,
        action: &FileAction,
        destination: &Path,
        plan: &mut RollbackPlan,
        renamed: &mut usize,
        linked: &mut usize,
    ) -> Result<(), ReconcileError> {
        match action {
            FileAction::Skip { .. } | FileAction::Missing { .. } => Ok(()),
            FileAction::Identical { local, length, .. }
            | FileAction::Link { local, length, .. } => {
                let source = job.local_root.join(local);
                if !source.exists() {
                    return Err(ReconcileError::SourceNotFound { path: source });
                }
                if destination.exists() {
                    // Idempotent re-run: an earlier attempt already staged it.
                    return Self::verify_length(destination, *length).await;
                }
                Self::ensure_parent_dirs(destination, plan).await?;
                let mode = match action {
                    FileAction::Link { mode, .. } => *mode,
                    _ => LinkingMode::Hard,
                };
                Self::link_chain(&source, destination, mode).await?;
                plan.record_path(destination.to_path_buf());
                *linked += 1;
                Self::verify_length(destination, *length).await
            }
            FileAction::Rename { local, length, .. } => {
                let source = job.local_root.join(local);
                if !source.exists() {
                    return Err(ReconcileError::SourceNotFound { path: source });
                }
                if destination.exists() {
                    return Err(ReconcileError::DestinationExists {
                        path: destination.to_path_buf(),
                    });
                }
                Self::ensure_parent_dirs(destination, plan).await?;
                if Self::try_atomic_move(&source, destination).await? {
                    plan.record_move(source, destination.to_path_buf());
                    *renamed += 1;
                } else {
                    // Cross-device: the original stays, a link satisfies the
                    // target instead.
                    Self::link_chain(&source, destination, LinkingMode::Hard).await?;
                    plan.record_path(destination.to_path_buf());
                    *linked += 1;
                }
                Self::verify_length(destination, *length).await
            }
        }
    }

    async fn rollback(plan: RollbackPlan) -> Result<(), ReconcileError> {
        let mut errors = Vec::new();

        for path in plan.created_paths.iter().rev() {
            if path.symlink_metadata().is_ok() {
                if let Err(e) = fs::remove_file(path).await {
                    errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }
        for (original, current) in plan.moves.iter().rev() {
            if current.exists() {
                if let Err(e) = fs::rename(current, original).await {
                    errors.push(format!("{}: {}", current.display(), e));
                }
            }
        }
        for dir in plan.created_dirs.iter().rev() {
            if dir.exists() {
                // Only empty directories are removed.
                let _ = fs::remove_dir(dir).await;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::RollbackFailed {
                reason: errors.join(", "),
            })
        }
    }

    async fn run(&self, job: ReconcileJob) -> Result<ReconcileReport, ReconcileError> {
        let start = Instant::now();

        if Self::already_satisfied(&job).await {
            return Ok(ReconcileReport {
                job_id: job.job_id,
                renamed: 0,
                linked: 0,
                already_in_place: true,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let final_root = job.target_root.join(&job.target_name);
        let staging_root = job
            .target_root
            .join(format!(".{}.partial", job.target_name));

        // A fresh target root is staged as a sibling and swapped in; when
        // the final root already exists (the target shares the local root
        // name) files are placed into it directly under a rollback plan.
        let fresh_root = !final_root.exists();

        // Stale staging from an aborted earlier run.
        if staging_root.exists() {
            if staging_root.is_dir() {
                fs::remove_dir_all(&staging_root).await?;
            } else {
                fs::remove_file(&staging_root).await?;
            }
        }

        let mut plan = RollbackPlan::default();
        let mut renamed = 0usize;
        let mut linked = 0usize;

        let result: Result<(), ReconcileError> = async {
            for action in &job.mapping.actions {
                if action.is_unsatisfied() {
                    continue;
                }
                let rel = Self::target_rel(action.target(), &job.target_name)?;
                let destination = if fresh_root {
                    if rel.is_empty() {
                        staging_root.clone()
                    } else {
                        staging_root.join(rel)
                    }
                } else {
                    job.target_root.join(action.target())
                };
                if !fresh_root && matches!(action, FileAction::Identical { .. }) {
                    // Already at its final path inside the existing root.
                    continue;
                }
                Self::execute_action(&job, action, &destination, &mut plan, &mut renamed, &mut linked)
                    .await?;
            }

            if fresh_root && plan.has_changes() {
                if final_root.exists() {
                    return Err(ReconcileError::DestinationExists { path: final_root.clone() });
                }
                fs::rename(&staging_root, &final_root).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(ReconcileReport {
                job_id: job.job_id,
                renamed,
                linked,
                already_in_place: false,
                duration_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => {
                warn!("reconcile {} failed, rolling back: {}", job.job_id, e);
                Self::rollback(plan).await?;
                if staging_root.exists() {
                    if staging_root.is_dir() {
                        let _ = fs::remove_dir_all(&staging_root).await;
                    } else {
                        let _ = fs::remove_file(&staging_root).await;
                    }
                }
                Err(e)
            }
        }
    }
}

impl Default for FsReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reconciler for FsReconciler {
    async fn reconcile(&self, job: ReconcileJob) -> Result<ReconcileReport, ReconcileError> {
        self.run(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::FileMapping;
    use tempfile::TempDir;

    fn mapping(actions: Vec<FileAction>) -> FileMapping {
        let unsatisfied_bytes = actions
            .iter()
            .filter(|a| a.is_unsatisfied())
            .map(|a| a.length())
            .sum();
        let matched_bytes = actions
            .iter()
            .filter(|a| !a.is_unsatisfied())
            .map(|a| a.length())
            .sum();
        FileMapping {
            actions,
            matched_bytes,
            unsatisfied_bytes,
        }
    }

    async fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.unwrap();
        }
        fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn links_into_fresh_root_and_swaps() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Album/01.flac"), "audio-bytes").await;

        let job = ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "Artist - Album (2020)".into(),
            mapping: mapping(vec![FileAction::Link {
                local: "Album/01.flac".into(),
                target: "Artist - Album (2020)/01.flac".into(),
                length: 11,
                mode: LinkingMode::Hard,
            }]),
        };

        let report = FsReconciler::new().reconcile(job).await.unwrap();
        assert_eq!(report.linked, 1);
        assert!(!report.already_in_place);

        let staged = root.join("Artist - Album (2020)/01.flac");
        assert!(staged.exists());
        // Original untouched.
        assert!(root.join("Album/01.flac").exists());
        // No staging residue.
        assert!(!root.join(".Artist - Album (2020).partial").exists());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Album/01.flac"), "audio-bytes").await;

        let job = || ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "New".into(),
            mapping: mapping(vec![FileAction::Link {
                local: "Album/01.flac".into(),
                target: "New/01.flac".into(),
                length: 11,
                mode: LinkingMode::Hard,
            }]),
        };

        let first = FsReconciler::new().reconcile(job()).await.unwrap();
        assert!(!first.already_in_place);
        let second = FsReconciler::new().reconcile(job()).await.unwrap();
        assert!(second.already_in_place);
        assert_eq!(second.linked, 0);
    }

    #[tokio::test]
    async fn rename_moves_in_place() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Album/01.flac"), "audio-bytes").await;

        let job = ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "Artist - Album".into(),
            mapping: mapping(vec![FileAction::Rename {
                local: "Album/01.flac".into(),
                target: "Artist - Album/01 - Track.flac".into(),
                length: 11,
            }]),
        };

        let report = FsReconciler::new().reconcile(job).await.unwrap();
        assert_eq!(report.renamed, 1);
        assert!(root.join("Artist - Album/01 - Track.flac").exists());
        assert!(!root.join("Album/01.flac").exists());
    }

    #[tokio::test]
    async fn failure_rolls_back_staging_and_renames() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Album/01.flac"), "audio-bytes").await;
        // 02.flac deliberately absent.

        let job = ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "New".into(),
            mapping: mapping(vec![
                FileAction::Rename {
                    local: "Album/01.flac".into(),
                    target: "New/01.flac".into(),
                    length: 11,
                },
                FileAction::Link {
                    local: "Album/02.flac".into(),
                    target: "New/02.flac".into(),
                    length: 5,
                    mode: LinkingMode::Hard,
                },
            ]),
        };

        let err = FsReconciler::new().reconcile(job).await.unwrap_err();
        assert!(matches!(err, ReconcileError::SourceNotFound { .. }));

        // The rename was undone and nothing staged survives.
        assert!(root.join("Album/01.flac").exists());
        assert!(!root.join("New").exists());
        assert!(!root.join(".New.partial").exists());
    }

    #[tokio::test]
    async fn single_file_target_stages_the_file_itself() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("track.flac"), "audio").await;

        let job = ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "Track.flac".into(),
            mapping: mapping(vec![FileAction::Link {
                local: "track.flac".into(),
                target: "Track.flac".into(),
                length: 5,
                mode: LinkingMode::Hard,
            }]),
        };

        let report = FsReconciler::new().reconcile(job).await.unwrap();
        assert_eq!(report.linked, 1);
        assert!(root.join("Track.flac").is_file());
        assert!(root.join("track.flac").exists());
    }

    #[tokio::test]
    async fn all_identical_mapping_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Album/01.flac"), "audio-bytes").await;

        let job = ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "Album".into(),
            mapping: mapping(vec![FileAction::Identical {
                local: "Album/01.flac".into(),
                target: "Album/01.flac".into(),
                length: 11,
            }]),
        };

        let report = FsReconciler::new().reconcile(job).await.unwrap();
        assert!(report.already_in_place);
    }

    #[tokio::test]
    async fn length_mismatch_fails_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("Album/01.flac"), "short").await;

        let job = ReconcileJob {
            job_id: "j1".into(),
            local_root: root.to_path_buf(),
            target_root: root.to_path_buf(),
            target_name: "New".into(),
            mapping: mapping(vec![FileAction::Link {
                local: "Album/01.flac".into(),
                target: "New/01.flac".into(),
                length: 999,
                mode: LinkingMode::Hard,
            }]),
        };

        let err = FsReconciler::new().reconcile(job).await.unwrap_err();
        assert!(matches!(err, ReconcileError::LengthMismatch { .. }));
        assert!(!root.join("New").exists());
        assert!(!root.join(".New.partial").exists());
    }
}
