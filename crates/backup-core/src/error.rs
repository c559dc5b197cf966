use thiserror::Error;

use crate::archive::ArchiveError;
use crate::checksum::ChecksumError;
use crate::config::ConfigError;
use crate::dump::DumpError;
use crate::encryption::EncryptionError;
use crate::keystore::KeyError;
use crate::lock::LockError;
use crate::manifest::ManifestError;

/// Failures surfaced by the backup and retention pipelines.
///
/// Stage errors convert into the matching variant with `?`; the orchestrators
/// turn whatever arrives here into a structured report instead of letting it
/// reach the caller.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("encryption key unavailable: {0}")]
    KeyAccess(#[from] KeyError),

    #[error("target discovery failed: {0}")]
    TargetDiscovery(String),

    #[error("database dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("archive failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("checksum unavailable: {0}")]
    Checksum(#[from] ChecksumError),

    #[error("retention cleanup failed: {0}")]
    Retention(String),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid backup id: {0}")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Stable identifier for the error class, used in JSON reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "config",
            BackupError::KeyAccess(_) => "key_access",
            BackupError::TargetDiscovery(_) => "target_discovery",
            BackupError::Dump(_) => "dump",
            BackupError::Archive(_) => "archive",
            BackupError::Encryption(_) => "encryption",
            BackupError::ChecksumMismatch { .. } => "checksum_mismatch",
            BackupError::Checksum(_) => "checksum_io",
            BackupError::Retention(_) => "retention_io",
            BackupError::Lock(LockError::Busy { .. }) => "busy",
            BackupError::Lock(_) => "lock",
            BackupError::Manifest(_) => "manifest",
            BackupError::NotFound(_) => "not_found",
            BackupError::InvalidId(_) => "invalid_id",
            BackupError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
