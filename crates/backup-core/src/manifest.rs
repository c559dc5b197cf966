//! `manifest.json` at the backup root: one entry per completed artifact.
//!
//! The manifest answers "when did the last full backup start" without parsing
//! file names, and records size and digest at completion time. It is advisory:
//! the files on disk remain the source of truth, and entries whose artifact is
//! gone are ignored when choosing a baseline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::layout::{staging_path_for, BackupKind, MANIFEST_FILE};
use crate::lock::{LockError, LockGuard, MANIFEST_LOCK};

pub const MANIFEST_VERSION: u32 = 1;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot access manifest {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("cannot parse manifest {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("manifest version {0} is newer than supported version {MANIFEST_VERSION}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Lock(#[from] LockError),
}

// ── Data model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// `<date>/<kind>/<file name>`.
    pub id: String,
    pub kind: BackupKind,
    /// Path relative to the backup root.
    pub file: String,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub entries: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

pub struct ManifestStore {
    root: PathBuf,
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(MANIFEST_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing manifest reads as empty.
    pub fn load(&self) -> Result<Manifest, ManifestError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(source) => {
                return Err(ManifestError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        let manifest: Manifest =
            serde_json::from_slice(&data).map_err(|source| ManifestError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;
        if manifest.version > MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(manifest.version));
        }
        Ok(manifest)
    }

    fn save(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let io_err = |source: io::Error| ManifestError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let json = serde_json::to_vec_pretty(manifest).map_err(|source| ManifestError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        let staging = staging_path_for(&self.path);
        let result = (|| {
            let mut file = File::create(&staging)?;
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&staging, &self.path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        result.map_err(io_err)
    }

    /// Load, apply `change`, save; all under the manifest lock.
    fn update<T>(&self, change: impl FnOnce(&mut Manifest) -> T) -> Result<T, ManifestError> {
        let _guard = LockGuard::acquire(&self.root, MANIFEST_LOCK)?;
        let mut manifest = match self.load() {
            Err(ManifestError::Parse { source, .. }) => {
                // Rebuilt from scratch; the unreadable copy is kept for inspection.
                let aside = self
                    .path
                    .with_extension(format!("json.corrupt-{}", Utc::now().timestamp()));
                warn!(path = %self.path.display(), moved_to = %aside.display(), error = %source, "manifest unreadable; starting a new one");
                fs::rename(&self.path, &aside).map_err(|source| ManifestError::Io {
                    path: self.path.display().to_string(),
                    source,
                })?;
                Manifest::default()
            }
            other => other?,
        };
        let out = change(&mut manifest);
        manifest.version = MANIFEST_VERSION;
        self.save(&manifest)?;
        Ok(out)
    }

    /// Add `entry`, replacing any entry with the same id.
    pub fn record(&self, entry: ManifestEntry) -> Result<(), ManifestError> {
        debug!(id = %entry.id, "recording manifest entry");
        self.update(|m| {
            m.entries.retain(|e| e.id != entry.id);
            m.entries.push(entry);
        })
    }

    /// Drop entries by id. Returns how many were removed.
    pub fn remove(&self, ids: &[String]) -> Result<usize, ManifestError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.update(|m| {
            let before = m.entries.len();
            m.entries.retain(|e| !ids.contains(&e.id));
            before - m.entries.len()
        })
    }

    /// Newest full backup whose artifact still exists.
    pub fn latest_full(&self) -> Result<Option<ManifestEntry>, ManifestError> {
        let manifest = self.load()?;
        Ok(manifest
            .entries
            .into_iter()
            .filter(|e| e.kind == BackupKind::Full && self.root.join(&e.file).is_file())
            .max_by_key(|e| e.started_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(root: &Path, kind: BackupKind, day: u32, create_file: bool) -> ManifestEntry {
        let started = Utc.with_ymd_and_hms(2026, 10, day, 2, 0, 0).unwrap();
        let date = started.date_naive();
        let name = format!("{kind}-{}.tar.gz.enc", started.format("%Y-%m-%dT%H-%M-%S-%3fZ"));
        let file = format!("{date}/{kind}/{name}");
        if create_file {
            let path = root.join(&file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"x").unwrap();
        }
        ManifestEntry {
            id: file.clone(),
            kind,
            file,
            date,
            started_at: started,
            completed_at: started + chrono::Duration::minutes(5),
            size: 1,
            digest: "00".repeat(32),
        }
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert_eq!(store.load().unwrap(), Manifest::default());
        assert!(store.latest_full().unwrap().is_none());
    }

    #[test]
    fn latest_full_skips_missing_artifacts_and_diffs() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let kept = entry(dir.path(), BackupKind::Full, 10, true);
        store.record(kept.clone()).unwrap();
        store.record(entry(dir.path(), BackupKind::Full, 12, false)).unwrap();
        store.record(entry(dir.path(), BackupKind::Diff, 13, true)).unwrap();

        assert_eq!(store.latest_full().unwrap(), Some(kept));
        assert_eq!(store.load().unwrap().entries.len(), 3);
    }

    #[test]
    fn record_replaces_and_remove_drops() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let mut e = entry(dir.path(), BackupKind::Full, 10, true);
        store.record(e.clone()).unwrap();
        e.size = 42;
        store.record(e.clone()).unwrap();
        assert_eq!(store.load().unwrap().entries, vec![e.clone()]);

        assert_eq!(store.remove(&[e.id.clone(), "unknown".into()]).unwrap(), 1);
        assert!(store.load().unwrap().entries.is_empty());
    }

    #[test]
    fn corrupt_manifest_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{").unwrap();
        let store = ManifestStore::new(dir.path());
        let err = store.load().unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));

        // The next write starts over and keeps the broken file aside.
        store.record(entry(dir.path(), BackupKind::Full, 10, true)).unwrap();
        assert_eq!(store.load().unwrap().entries.len(), 1);
        let aside = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("manifest.json.corrupt-")
            })
            .count();
        assert_eq!(aside, 1);
    }
}
