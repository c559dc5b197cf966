//! Read/manage view of the backup root for the admin surface.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::checksum::ChecksumService;
use crate::context::BackupContext;
use crate::encryption::{cipher_for_extension, EncryptionError, EncryptionService};
use crate::engine::{BackupEngine, BackupReport};
use crate::error::{BackupError, Result};
use crate::keystore::KeyStore;
use crate::layout::{
    date_dir, date_dir_name, parse_date_dir, scan_artifacts, ArtifactName, BackupKind,
    StoredArtifact,
};
use crate::lock::{LockError, LockGuard};
use crate::manifest::ManifestStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Complete,
    MissingChecksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListing {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub status: ListingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Verified,
    Corrupted,
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub id: String,
    pub status: VerifyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub success: bool,
    pub message: String,
}

impl AdminResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_space: u64,
    pub used_space: u64,
    pub backup_space: u64,
}

/// Progress of the backup started by [`BackupCatalog::trigger_backup`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<BackupKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<BackupReport>,
}

#[derive(Default)]
struct TriggerState {
    status: TriggerStatus,
    worker: Option<JoinHandle<()>>,
}

pub struct BackupCatalog {
    ctx: BackupContext,
    trigger: Arc<Mutex<TriggerState>>,
}

impl BackupCatalog {
    pub fn new(ctx: BackupContext) -> Self {
        Self {
            ctx,
            trigger: Arc::new(Mutex::new(TriggerState::default())),
        }
    }

    fn root(&self) -> &Path {
        &self.ctx.config.backup_root
    }

    /// Newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupListing>> {
        let checksums = ChecksumService::new(self.ctx.config.digest_extension.clone());
        let mut listings = Vec::new();
        for artifact in scan_artifacts(self.root())?.into_iter().rev() {
            let size = match fs::metadata(&artifact.path) {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            let status = if checksums.sidecar_for(&artifact.path).is_file() {
                ListingStatus::Complete
            } else {
                ListingStatus::MissingChecksum
            };
            listings.push(BackupListing {
                id: artifact.id(),
                filename: artifact.name.file_name(),
                size,
                created_at: artifact.name.created_at,
                kind: artifact.name.kind,
                status,
            });
        }
        Ok(listings)
    }

    /// Resolve an id of the form `<date>/<kind>/<file name>` to a path inside
    /// the root. Anything else, including `..` tricks, is rejected.
    pub fn resolve(&self, id: &str) -> Result<StoredArtifact> {
        let invalid = || BackupError::InvalidId(id.to_string());
        let mut parts = id.split('/');
        let (Some(date), Some(kind), Some(file), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let date = parse_date_dir(date).ok_or_else(invalid)?;
        let kind: BackupKind = kind.parse().map_err(|_| invalid())?;
        let name = ArtifactName::parse(file).ok_or_else(invalid)?;
        if name.kind != kind {
            return Err(invalid());
        }
        let path = date_dir(self.root(), date).join(kind.as_str()).join(file);
        Ok(StoredArtifact { date, path, name })
    }

    pub fn verify_backup(&self, id: &str) -> Result<VerifyReport> {
        let artifact = self.resolve(id)?;
        if !artifact.path.is_file() {
            return Err(BackupError::NotFound(id.to_string()));
        }
        let checksums = ChecksumService::new(self.ctx.config.digest_extension.clone());
        let report = match checksums.check(&artifact.path) {
            Ok(v) => VerifyReport {
                id: id.to_string(),
                status: if v.matches() {
                    VerifyStatus::Verified
                } else {
                    VerifyStatus::Corrupted
                },
                expected: Some(v.expected),
                actual: Some(v.actual),
                error: None,
            },
            Err(e) => VerifyReport {
                id: id.to_string(),
                status: VerifyStatus::Unreadable,
                expected: None,
                actual: None,
                error: Some(e.to_string()),
            },
        };
        info!(id, status = ?report.status, "backup verified");
        Ok(report)
    }

    pub fn delete_backup(&self, id: &str) -> AdminResponse {
        match self.delete(id) {
            Ok(()) => AdminResponse::ok(format!("Backup {id} deleted")),
            Err(e) => {
                warn!(id, error = %e, "backup delete failed");
                AdminResponse::failed(e.to_string())
            }
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let artifact = self.resolve(id)?;
        let day = date_dir_name(artifact.date);
        let Some(_lock) = LockGuard::try_acquire(self.root(), &day)? else {
            return Err(LockError::Busy { name: day }.into());
        };
        match fs::remove_file(&artifact.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        let sidecar = ChecksumService::new(self.ctx.config.digest_extension.clone())
            .sidecar_for(&artifact.path);
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %sidecar.display(), error = %e, "cannot delete checksum file"),
        }
        if let Some(kind_dir) = artifact.path.parent() {
            if fs::remove_dir(kind_dir).is_ok() {
                if let Some(day) = kind_dir.parent() {
                    let day_empty = fs::read_dir(day)
                        .map(|mut e| e.next().is_none())
                        .unwrap_or(false);
                    if day_empty {
                        let _ = fs::remove_dir(day);
                    }
                }
            }
        }
        ManifestStore::new(self.root()).remove(&[id.to_string()])?;
        info!(id, "backup deleted");
        Ok(())
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let root = self.root();
        let (total_space, used_space) = filesystem_usage(root)?;
        let backup_space = WalkDir::new(root)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Ok(StorageStats {
            total_space,
            used_space,
            backup_space,
        })
    }

    /// Start a backup on a worker thread and return at once. Only one
    /// triggered backup runs at a time; poll [`Self::trigger_status`].
    pub fn trigger_backup(&self, kind: BackupKind) -> AdminResponse {
        let mut state = self.trigger.lock();
        if state.status.running {
            return AdminResponse::failed("a triggered backup is already running");
        }
        state.status.running = true;
        state.status.requested = Some(kind);

        let engine = BackupEngine::new(self.ctx.clone());
        let shared = Arc::clone(&self.trigger);
        let spawned = thread::Builder::new()
            .name(format!("backup-{kind}"))
            .spawn(move || {
                let report = engine.execute_backup(kind);
                let mut state = shared.lock();
                state.status.running = false;
                state.status.last_report = Some(report);
            });
        match spawned {
            Ok(handle) => {
                state.worker = Some(handle);
                info!(kind = %kind, "backup triggered");
                AdminResponse::ok(format!("{kind} backup started"))
            }
            Err(e) => {
                state.status.running = false;
                error!(error = %e, "cannot start backup worker");
                AdminResponse::failed(format!("cannot start backup worker: {e}"))
            }
        }
    }

    pub fn trigger_status(&self) -> TriggerStatus {
        self.trigger.lock().status.clone()
    }

    /// Block until the triggered backup (if any) finishes and return its report.
    pub fn wait_for_trigger(&self) -> Option<BackupReport> {
        let worker = self.trigger.lock().worker.take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("backup worker panicked");
                let mut state = self.trigger.lock();
                state.status.running = false;
            }
        }
        self.trigger.lock().status.last_report.clone()
    }

    /// Decrypt an artifact with the stored key. The cipher is chosen by the
    /// artifact's extension, so `gpg` artifacts stay readable after switching
    /// backends.
    pub fn decrypt_backup(&self, artifact: &Path, output: &Path) -> Result<()> {
        let extension = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ArtifactName::parse)
            .map(|n| n.extension)
            .or_else(|| {
                artifact
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let cipher = cipher_for_extension(&self.ctx, &extension).ok_or_else(|| {
            EncryptionError::Format {
                path: artifact.display().to_string(),
                reason: format!("unknown encryption extension {extension:?}"),
            }
        })?;
        let key = KeyStore::new(&self.ctx.config.key_file).load_existing()?;
        EncryptionService::new(cipher).decrypt(artifact, output, &key)?;
        Ok(())
    }
}

#[cfg(unix)]
fn filesystem_usage(path: &Path) -> Result<(u64, u64)> {
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| BackupError::InvalidId(path.display().to_string()))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let stat = unsafe { stat.assume_init() };
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let free = stat.f_bfree as u64 * frsize;
    Ok((total, total.saturating_sub(free)))
}

#[cfg(not(unix))]
fn filesystem_usage(_path: &Path) -> Result<(u64, u64)> {
    Ok((0, 0))
}

/// Where `decrypt` writes when the operator gives a directory.
pub fn default_restore_name(artifact: &Path, output: &Path) -> PathBuf {
    if !output.is_dir() {
        return output.to_path_buf();
    }
    let name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(ArtifactName::parse)
        .map(|n| n.plaintext_name())
        .unwrap_or_else(|| "restored.tar.gz".to_string());
    output.join(name)
}
