//! On-disk layout of the backup root.
//!
//! ```text
//! <root>/<YYYY-MM-DD>/full/full-<timestamp>.tar.gz.<enc-ext>
//! <root>/<YYYY-MM-DD>/full/full-<timestamp>.tar.gz.<enc-ext>.<digest-ext>
//! <root>/<YYYY-MM-DD>/diff/diff-<timestamp>.tar.gz.<enc-ext>[.<digest-ext>]
//! <root>/manifest.json
//! <root>/.locks/<YYYY-MM-DD>.lock
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// `2026-10-16T03-15-00-123Z`: ISO-8601 with `:` and `.` replaced so the name
/// is portable.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const STAGING_PREFIX: &str = ".staging-";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCKS_DIR: &str = ".locks";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Diff,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Diff => "diff",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "diff" => Ok(BackupKind::Diff),
            other => Err(format!("unknown backup type {other:?} (expected full or diff)")),
        }
    }
}

/// Parse a directory name that must be exactly `YYYY-MM-DD`.
pub fn parse_date_dir(name: &str) -> Option<NaiveDate> {
    let bytes = name.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}

pub fn date_dir_name(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn date_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(date_dir_name(date))
}

pub fn kind_dir(root: &Path, date: NaiveDate, kind: BackupKind) -> PathBuf {
    date_dir(root, date).join(kind.as_str())
}

/// The encrypted archive file name, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub extension: String,
}

impl ArtifactName {
    pub fn new(kind: BackupKind, created_at: DateTime<Utc>, extension: &str) -> Self {
        Self {
            kind,
            created_at,
            extension: extension.to_string(),
        }
    }

    /// Name of the plaintext archive this artifact is encrypted from.
    pub fn plaintext_name(&self) -> String {
        format!(
            "{}-{}{}",
            self.kind,
            self.created_at.format(FILE_TIMESTAMP_FORMAT),
            ARCHIVE_SUFFIX
        )
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.plaintext_name(), self.extension)
    }

    pub fn sidecar_name(&self, digest_extension: &str) -> String {
        format!("{}.{}", self.file_name(), digest_extension)
    }

    /// Parse `<kind>-<timestamp>.tar.gz.<ext>`. Sidecars, staging files and
    /// bare plaintext archives do not parse.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (kind, rest) = if let Some(rest) = file_name.strip_prefix("full-") {
            (BackupKind::Full, rest)
        } else if let Some(rest) = file_name.strip_prefix("diff-") {
            (BackupKind::Diff, rest)
        } else {
            return None;
        };
        let (stamp, extension) = rest.split_once(ARCHIVE_SUFFIX)?;
        let extension = extension.strip_prefix('.')?;
        if extension.is_empty() || extension.contains('.') || extension.contains('/') {
            return None;
        }
        let created_at = NaiveDateTime::parse_from_str(stamp, FILE_TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        Some(Self {
            kind,
            created_at,
            extension: extension.to_string(),
        })
    }
}

pub fn sidecar_path(artifact: &Path, digest_extension: &str) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(digest_extension);
    artifact.with_file_name(name)
}

/// An encrypted artifact found under the backup root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub date: NaiveDate,
    pub path: PathBuf,
    pub name: ArtifactName,
}

impl StoredArtifact {
    /// `<date>/<kind>/<file name>`, the identifier used by the admin surface.
    pub fn id(&self) -> String {
        format!(
            "{}/{}/{}",
            date_dir_name(self.date),
            self.name.kind,
            self.name.file_name()
        )
    }
}

/// Every artifact in strict date directories, oldest first.
///
/// Only failing to list `root` itself is an error; unreadable subdirectories
/// are logged and skipped. A missing root yields an empty list.
pub fn scan_artifacts(root: &Path) -> std::io::Result<Vec<StoredArtifact>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let Some(date) = entry.file_name().to_str().and_then(parse_date_dir) else {
            continue;
        };
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        for kind in [BackupKind::Full, BackupKind::Diff] {
            let dir = entry.path().join(kind.as_str());
            let files = match std::fs::read_dir(&dir) {
                Ok(files) => files,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot list backup directory");
                    continue;
                }
            };
            for file in files.flatten() {
                let Some(name) = file.file_name().to_str().and_then(ArtifactName::parse) else {
                    continue;
                };
                if name.kind == kind {
                    found.push(StoredArtifact {
                        date,
                        path: file.path(),
                        name,
                    });
                }
            }
        }
    }
    found.sort_by(|a, b| {
        (a.date, a.name.created_at, a.name.file_name()).cmp(&(b.date, b.name.created_at, b.name.file_name()))
    });
    Ok(found)
}

/// A staging path next to `dest`, so the final rename stays on one filesystem.
pub fn staging_path_for(dest: &Path) -> PathBuf {
    let name = format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4());
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
