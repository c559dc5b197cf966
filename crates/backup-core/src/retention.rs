//! Retention cleanup.
//!
//! Two independent rules over the strict `YYYY-MM-DD` directories under the
//! backup root:
//!
//! * keep the newest `max_full_backups` full artifacts, wherever they live,
//!   and delete the rest with their sidecars;
//! * in every date directory older than `today - max_differential_age_days`,
//!   delete everything in `diff/`, then prune the directories left empty.
//!
//! The age rule never touches `full/` contents. Deletion is best effort: a
//! failure on one file is recorded and the run moves on. Directories locked by
//! a running backup are skipped.

use chrono::{NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::context::BackupContext;
use crate::error::BackupError;
use crate::layout::{
    date_dir_name, parse_date_dir, sidecar_path, ArtifactName, BackupKind, StoredArtifact,
};
use crate::lock::LockGuard;
use crate::manifest::ManifestStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub success: bool,
    pub freed_bytes: u64,
    pub before: StorageUsage,
    pub after: StorageUsage,
    pub deleted_full: usize,
    pub deleted_diff: usize,
    pub removed_dirs: usize,
    /// Date directories left alone because a backup held their lock.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_dirs: Vec<String>,
    /// Per-file failures; they do not fail the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

struct DateDir {
    date: NaiveDate,
    path: PathBuf,
    /// `None` when another process holds the directory.
    lock: Option<LockGuard>,
}

pub struct RetentionCleanupService {
    ctx: BackupContext,
}

impl RetentionCleanupService {
    pub fn new(ctx: BackupContext) -> Self {
        Self { ctx }
    }

    pub fn execute_cleanup(&self) -> CleanupReport {
        self.execute_cleanup_at(Utc::now().date_naive())
    }

    /// Cleanup as if the current UTC date were `today`.
    pub fn execute_cleanup_at(&self, today: NaiveDate) -> CleanupReport {
        let root = self.ctx.config.backup_root.as_path();
        info!(root = %root.display(), today = %today, "retention cleanup started");
        let mut report = CleanupReport::default();

        let mut dirs = match self.date_dirs(root) {
            Ok(dirs) => dirs,
            Err(e) => {
                error!(root = %root.display(), error = %e, "cannot enumerate backup root");
                report.error = Some(e.to_string());
                report.error_kind = Some(e.kind().to_string());
                return report;
            }
        };
        report.before = usage(&dirs);

        for dir in &mut dirs {
            match LockGuard::try_acquire(root, &date_dir_name(dir.date)) {
                Ok(Some(guard)) => dir.lock = Some(guard),
                Ok(None) => {
                    warn!(dir = %dir.path.display(), "backup in progress; directory skipped");
                    report.skipped_dirs.push(date_dir_name(dir.date));
                }
                Err(e) => {
                    warn!(dir = %dir.path.display(), error = %e, "cannot lock directory; skipped");
                    report.skipped_dirs.push(date_dir_name(dir.date));
                    report.errors.push(e.to_string());
                }
            }
        }

        let mut removed_ids = Vec::new();
        self.apply_full_rule(&dirs, &mut report, &mut removed_ids);
        self.apply_age_rule(&dirs, today, &mut report, &mut removed_ids);

        if let Err(e) = ManifestStore::new(root).remove(&removed_ids) {
            warn!(error = %e, "cannot drop deleted backups from the manifest");
            report.errors.push(e.to_string());
        }

        let remaining: Vec<DateDir> = dirs.into_iter().filter(|d| d.path.is_dir()).collect();
        report.after = usage(&remaining);
        report.freed_bytes = report.before.bytes.saturating_sub(report.after.bytes);
        report.success = true;
        info!(
            freed_bytes = report.freed_bytes,
            deleted_full = report.deleted_full,
            deleted_diff = report.deleted_diff,
            errors = report.errors.len(),
            "retention cleanup finished"
        );
        report
    }

    fn date_dirs(&self, root: &Path) -> Result<Vec<DateDir>, BackupError> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(root = %root.display(), "backup root does not exist; nothing to clean");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(BackupError::Retention(format!(
                    "cannot read {}: {e}",
                    root.display()
                )))
            }
        };
        let mut dirs: Vec<DateDir> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let date = e.file_name().to_str().and_then(parse_date_dir)?;
                Some(DateDir {
                    date,
                    path: e.path(),
                    lock: None,
                })
            })
            .collect();
        dirs.sort_by_key(|d| d.date);
        Ok(dirs)
    }

    /// Keep the newest `max_full_backups` full artifacts across all dates.
    /// Artifacts in locked directories still count toward the total.
    fn apply_full_rule(&self, dirs: &[DateDir], report: &mut CleanupReport, removed: &mut Vec<String>) {
        let keep = self.ctx.config.retention.max_full_backups;
        let mut artifacts: Vec<(StoredArtifact, bool)> = Vec::new();
        for dir in dirs {
            let full = dir.path.join(BackupKind::Full.as_str());
            let entries = match fs::read_dir(&full) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %full.display(), error = %e, "cannot list full backups");
                    report.errors.push(format!("{}: {e}", full.display()));
                    continue;
                }
            };
            for entry in entries.flatten() {
                let Some(name) = entry.file_name().to_str().and_then(ArtifactName::parse) else {
                    continue;
                };
                if name.kind != BackupKind::Full {
                    continue;
                }
                let artifact = StoredArtifact {
                    date: dir.date,
                    path: entry.path(),
                    name,
                };
                artifacts.push((artifact, dir.lock.is_some()));
            }
        }
        artifacts.sort_by(|(a, _), (b, _)| {
            (a.date, a.name.created_at, a.name.file_name())
                .cmp(&(b.date, b.name.created_at, b.name.file_name()))
        });

        let excess = artifacts.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        info!(total = artifacts.len(), keep, "pruning old full backups");
        let mut touched = BTreeSet::new();
        for (artifact, unlocked) in artifacts.into_iter().take(excess) {
            if !unlocked {
                continue;
            }
            if self.delete_artifact(&artifact.path, report) {
                report.deleted_full += 1;
                removed.push(artifact.id());
            }
            if let Some(parent) = artifact.path.parent() {
                touched.insert(parent.to_path_buf());
            }
        }
        for dir in touched {
            if remove_dir_if_empty(&dir, report) {
                report.removed_dirs += 1;
            }
        }
    }

    /// Empty `diff/` in every unlocked date directory strictly older than the
    /// cutoff, then prune whatever that leaves empty.
    fn apply_age_rule(
        &self,
        dirs: &[DateDir],
        today: NaiveDate,
        report: &mut CleanupReport,
        removed: &mut Vec<String>,
    ) {
        let days = self.ctx.config.retention.max_differential_age_days;
        let Some(cutoff) = TimeDelta::try_days(days).and_then(|age| today.checked_sub_signed(age)) else {
            warn!(days, "differential age limit reaches before the earliest date; nothing expires");
            return;
        };
        for dir in dirs.iter().filter(|d| d.date < cutoff && d.lock.is_some()) {
            let diff = dir.path.join(BackupKind::Diff.as_str());
            match fs::read_dir(&diff) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                            continue;
                        }
                        let name = entry.file_name();
                        let parsed = name.to_str().and_then(ArtifactName::parse);
                        match fs::remove_file(entry.path()) {
                            Ok(()) => {
                                if let Some(name) = parsed {
                                    report.deleted_diff += 1;
                                    removed.push(
                                        StoredArtifact {
                                            date: dir.date,
                                            path: entry.path(),
                                            name,
                                        }
                                        .id(),
                                    );
                                }
                                info!(path = %entry.path().display(), "expired differential file deleted");
                            }
                            Err(e) => {
                                warn!(path = %entry.path().display(), error = %e, "cannot delete expired differential file");
                                report.errors.push(format!("{}: {e}", entry.path().display()));
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = %diff.display(), error = %e, "cannot list differential backups");
                    report.errors.push(format!("{}: {e}", diff.display()));
                }
            }

            // diff/ first, then a full/ emptied by the count rule, then the day.
            for sub in [diff, dir.path.join(BackupKind::Full.as_str()), dir.path.clone()] {
                if remove_dir_if_empty(&sub, report) {
                    report.removed_dirs += 1;
                }
            }
        }
    }

    /// Delete an artifact and its sidecar. Returns whether the artifact went.
    fn delete_artifact(&self, path: &Path, report: &mut CleanupReport) -> bool {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "cannot delete backup");
            report.errors.push(format!("{}: {e}", path.display()));
            return false;
        }
        info!(path = %path.display(), "old full backup deleted");
        let sidecar = sidecar_path(path, &self.ctx.config.digest_extension);
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %sidecar.display(), error = %e, "cannot delete checksum file");
                report.errors.push(format!("{}: {e}", sidecar.display()));
            }
        }
        true
    }
}

/// Returns true only when the directory existed, was empty and was removed.
fn remove_dir_if_empty(dir: &Path, report: &mut CleanupReport) -> bool {
    let empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return false,
    };
    if !empty {
        return false;
    }
    match fs::remove_dir(dir) {
        Ok(()) => {
            info!(dir = %dir.display(), "empty directory removed");
            true
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot remove empty directory");
            report.errors.push(format!("{}: {e}", dir.display()));
            false
        }
    }
}

fn usage(dirs: &[DateDir]) -> StorageUsage {
    let mut total = StorageUsage::default();
    for dir in dirs {
        for entry in WalkDir::new(&dir.path).into_iter().flatten() {
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    total.files += 1;
                    total.bytes += meta.len();
                }
            }
        }
    }
    total
}
