//! The backup pipeline: prepare directories, load the key, discover targets,
//! dump, archive, encrypt, checksum, verify, record.
//!
//! Every stage error is caught here and turned into a failed [`BackupReport`];
//! `execute_backup` itself never returns an error.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::archive::{ArchiveService, DatabaseDump, ExcludeSet};
use crate::checksum::{ArtifactVerifier, ChecksumService};
use crate::context::BackupContext;
use crate::discovery::{BackupTargets, TargetDiscovery};
use crate::dump::DumpService;
use crate::encryption::{cipher_for, ArtifactCipher, EncryptionService};
use crate::error::{BackupError, Result};
use crate::keystore::KeyStore;
use crate::layout::{
    date_dir, date_dir_name, kind_dir, scan_artifacts, ArtifactName, BackupKind, StoredArtifact,
    STAGING_PREFIX,
};
use crate::lock::LockGuard;
use crate::manifest::{ManifestEntry, ManifestStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub success: bool,
    /// What was produced; `full` when a differential request fell back.
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub requested_type: BackupKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl BackupReport {
    fn failed(requested: BackupKind, started_at: DateTime<Utc>, err: &BackupError) -> Self {
        Self {
            success: false,
            kind: requested,
            requested_type: requested,
            id: None,
            file: None,
            size: None,
            digest: None,
            started_at,
            finished_at: Utc::now(),
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
        }
    }
}

struct Completed {
    kind: BackupKind,
    artifact: StoredArtifact,
    size: u64,
    digest: String,
}

pub struct BackupEngine {
    ctx: BackupContext,
    cipher: Arc<dyn ArtifactCipher>,
    verifier: Arc<dyn ArtifactVerifier>,
}

impl BackupEngine {
    /// Engine using the configured cipher backend.
    pub fn new(ctx: BackupContext) -> Self {
        let cipher = cipher_for(&ctx);
        Self::with_cipher(ctx, cipher)
    }

    pub fn with_cipher(ctx: BackupContext, cipher: Arc<dyn ArtifactCipher>) -> Self {
        let verifier = Arc::new(ChecksumService::new(ctx.config.digest_extension.clone()));
        Self {
            ctx,
            cipher,
            verifier,
        }
    }

    /// Replace the sidecar checksum step.
    pub fn with_verifier(mut self, verifier: Arc<dyn ArtifactVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn context(&self) -> &BackupContext {
        &self.ctx
    }

    pub fn execute_backup(&self, requested: BackupKind) -> BackupReport {
        let started_at = Utc::now();
        info!(requested = %requested, "backup started");
        match self.run(requested, started_at) {
            Ok(done) => {
                info!(
                    kind = %done.kind,
                    file = %done.artifact.path.display(),
                    size = done.size,
                    "backup completed"
                );
                BackupReport {
                    success: true,
                    kind: done.kind,
                    requested_type: requested,
                    id: Some(done.artifact.id()),
                    file: Some(done.artifact.path),
                    size: Some(done.size),
                    digest: Some(done.digest),
                    started_at,
                    finished_at: Utc::now(),
                    error: None,
                    error_kind: None,
                }
            }
            Err(e) => {
                error!(requested = %requested, kind = e.kind(), error = %e, "backup failed");
                BackupReport::failed(requested, started_at, &e)
            }
        }
    }

    fn run(&self, requested: BackupKind, started_at: DateTime<Utc>) -> Result<Completed> {
        let config = &self.ctx.config;
        let root = config.backup_root.as_path();
        let today = started_at.date_naive();

        fs::create_dir_all(root)?;
        let _lock = LockGuard::acquire(root, &date_dir_name(today))?;
        self.prepare_directories(today)?;
        self.remove_orphaned_staging(today);

        let key = KeyStore::new(&config.key_file).load_or_create()?;
        let targets = TargetDiscovery::new(&self.ctx).discover_targets();

        let baseline = match requested {
            BackupKind::Full => None,
            BackupKind::Diff => {
                let found = self.find_baseline();
                if found.is_none() {
                    warn!("no previous full backup found; running a full backup instead");
                }
                found
            }
        };
        let kind = if baseline.is_some() {
            BackupKind::Diff
        } else {
            BackupKind::Full
        };

        let staging = self.staging_dir()?;
        let dumps = match kind {
            BackupKind::Full => self.dump_databases(&targets, staging.path())?,
            BackupKind::Diff => Vec::new(),
        };

        let name = ArtifactName::new(kind, started_at, self.cipher.extension());
        let plaintext = kind_dir(root, today, kind).join(name.plaintext_name());
        let archiver = ArchiveService::new(ExcludeSet::new(&config.exclude_patterns));
        match requested {
            BackupKind::Full => archiver.build_full_archive(&targets, &dumps, &plaintext)?,
            BackupKind::Diff => {
                archiver.build_differential_archive(&targets, baseline, &dumps, &plaintext)?
            }
        };
        drop(staging);

        let encrypted = EncryptionService::new(self.cipher.clone()).encrypt(&plaintext, &key)?;

        let digest = self.verifier.generate(&encrypted)?;
        let verification = self.verifier.check(&encrypted)?;
        if !verification.matches() {
            return Err(BackupError::ChecksumMismatch {
                path: encrypted.display().to_string(),
                expected: verification.expected,
                actual: verification.actual,
            });
        }
        let size = fs::metadata(&encrypted)?.len();

        let artifact = StoredArtifact {
            date: today,
            path: encrypted,
            name,
        };
        self.record(&artifact, started_at, size, &digest);
        Ok(Completed {
            kind,
            artifact,
            size,
            digest,
        })
    }

    fn prepare_directories(&self, today: NaiveDate) -> Result<()> {
        let root = &self.ctx.config.backup_root;
        let day = date_dir(root, today);
        for dir in [
            day.clone(),
            kind_dir(root, today, BackupKind::Full),
            kind_dir(root, today, BackupKind::Diff),
        ] {
            fs::create_dir_all(&dir)?;
            restrict_dir(&dir);
        }
        Ok(())
    }

    /// Staging files left by an interrupted run are never valid artifacts.
    fn remove_orphaned_staging(&self, today: NaiveDate) {
        let root = &self.ctx.config.backup_root;
        for kind in [BackupKind::Full, BackupKind::Diff] {
            let dir = kind_dir(root, today, kind);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                    continue;
                }
                warn!(path = %entry.path().display(), "removing staging file from an interrupted run");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "cannot remove staging file");
                }
            }
        }
    }

    /// Start time of the newest full backup: from the manifest when it knows
    /// one whose artifact still exists, otherwise from the name of the newest
    /// full artifact on disk whose sidecar verifies.
    fn find_baseline(&self) -> Option<DateTime<Utc>> {
        let root = &self.ctx.config.backup_root;
        match ManifestStore::new(root).latest_full() {
            Ok(Some(entry)) => {
                info!(id = %entry.id, baseline = %entry.started_at, "baseline from manifest");
                return Some(entry.started_at);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cannot read manifest; scanning backup root for a baseline"),
        }
        match scan_artifacts(root) {
            Ok(artifacts) => {
                let mut fulls: Vec<StoredArtifact> = artifacts
                    .into_iter()
                    .filter(|a| a.name.kind == BackupKind::Full)
                    .collect();
                fulls.sort_by_key(|a| a.name.created_at);
                let newest = fulls.into_iter().rev().find(|a| match self.verifier.check(&a.path) {
                    Ok(v) if v.matches() => true,
                    Ok(_) => {
                        warn!(id = %a.id(), "full backup fails its checksum; not a baseline");
                        false
                    }
                    Err(e) => {
                        warn!(id = %a.id(), error = %e, "full backup cannot be verified; not a baseline");
                        false
                    }
                })?;
                info!(id = %newest.id(), baseline = %newest.name.created_at, "baseline from artifact name");
                Some(newest.name.created_at)
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "cannot scan backup root for a baseline");
                None
            }
        }
    }

    fn staging_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("om-backup-");
        let dir = match &self.ctx.config.staging_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        restrict_dir(dir.path());
        Ok(dir)
    }

    fn dump_databases(&self, targets: &BackupTargets, staging: &Path) -> Result<Vec<DatabaseDump>> {
        let dumper = DumpService::new(&self.ctx);
        let mut dumps = Vec::with_capacity(targets.databases.len());
        for database in &targets.databases {
            let path = staging.join(format!("{database}.sql.gz"));
            dumper.dump(database, &path)?;
            dumps.push(DatabaseDump {
                database: database.clone(),
                path,
            });
        }
        Ok(dumps)
    }

    /// A manifest write failure does not undo a verified artifact; the next
    /// differential run falls back to scanning the root.
    fn record(&self, artifact: &StoredArtifact, started_at: DateTime<Utc>, size: u64, digest: &str) {
        let root = &self.ctx.config.backup_root;
        let file = artifact
            .path
            .strip_prefix(root)
            .unwrap_or(&artifact.path)
            .to_string_lossy()
            .into_owned();
        let entry = ManifestEntry {
            id: artifact.id(),
            kind: artifact.name.kind,
            file,
            date: artifact.date,
            started_at,
            completed_at: Utc::now(),
            size,
            digest: digest.to_string(),
        };
        if let Err(e) = ManifestStore::new(root).record(entry) {
            warn!(error = %e, "backup succeeded but the manifest was not updated");
        }
    }
}

fn restrict_dir(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!(path = %path.display(), error = %e, "cannot restrict directory permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
