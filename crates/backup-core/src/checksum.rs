use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::layout::{sidecar_path, staging_path_for};

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("cannot read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("checksum file {path} is missing")]
    MissingSidecar { path: String },
    #[error("checksum file {path} is malformed")]
    MalformedSidecar { path: String },
}

/// Expected digest from the sidecar next to the digest actually computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub expected: String,
    pub actual: String,
}

impl Verification {
    pub fn matches(&self) -> bool {
        self.expected.eq_ignore_ascii_case(&self.actual)
    }
}

/// Seals a finished artifact and checks it again afterwards.
pub trait ArtifactVerifier: Send + Sync {
    /// Write the sidecar; returns the hex digest.
    fn generate(&self, artifact: &Path) -> Result<String, ChecksumError>;
    fn check(&self, artifact: &Path) -> Result<Verification, ChecksumError>;
}

/// SHA-256 sidecars in `sha256sum` format: `<hex>  <file name>\n`.
pub struct ChecksumService {
    extension: String,
}

impl ChecksumService {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    pub fn sidecar_for(&self, artifact: &Path) -> PathBuf {
        sidecar_path(artifact, &self.extension)
    }

    /// Hash `artifact` and write its sidecar atomically. Returns the hex digest.
    pub fn generate(&self, artifact: &Path) -> Result<String, ChecksumError> {
        let digest = hash_file(artifact)?;
        let sidecar = self.sidecar_for(artifact);
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        write_atomically(&sidecar, format!("{digest}  {file_name}\n").as_bytes()).map_err(
            |source| ChecksumError::Io {
                path: sidecar.display().to_string(),
                source,
            },
        )?;
        info!(path = %artifact.display(), digest = %digest, "checksum generated");
        Ok(digest)
    }

    /// Recompute the digest of `artifact` and compare it with its sidecar.
    pub fn check(&self, artifact: &Path) -> Result<Verification, ChecksumError> {
        let expected = self.read_sidecar(artifact)?;
        let actual = hash_file(artifact)?;
        let verification = Verification { expected, actual };
        if !verification.matches() {
            warn!(
                path = %artifact.display(),
                expected = %verification.expected,
                actual = %verification.actual,
                "checksum mismatch"
            );
        }
        Ok(verification)
    }

    /// `Ok(false)` means the content does not match; I/O problems and a
    /// missing or garbled sidecar are errors.
    pub fn verify(&self, artifact: &Path) -> Result<bool, ChecksumError> {
        self.check(artifact).map(|v| v.matches())
    }

    pub fn read_sidecar(&self, artifact: &Path) -> Result<String, ChecksumError> {
        let sidecar = self.sidecar_for(artifact);
        let contents = match fs::read_to_string(&sidecar) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ChecksumError::MissingSidecar {
                    path: sidecar.display().to_string(),
                })
            }
            Err(source) => {
                return Err(ChecksumError::Io {
                    path: sidecar.display().to_string(),
                    source,
                })
            }
        };
        contents
            .split_whitespace()
            .next()
            .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ChecksumError::MalformedSidecar {
                path: sidecar.display().to_string(),
            })
    }
}

impl ArtifactVerifier for ChecksumService {
    fn generate(&self, artifact: &Path) -> Result<String, ChecksumError> {
        ChecksumService::generate(self, artifact)
    }

    fn check(&self, artifact: &Path) -> Result<Verification, ChecksumError> {
        ChecksumService::check(self, artifact)
    }
}

pub fn hash_file(path: &Path) -> Result<String, ChecksumError> {
    let io_err = |source: io::Error| ChecksumError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let staging = staging_path_for(path);
    let result = (|| {
        let mut file = File::create(&staging)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&staging, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sidecar_uses_sha256sum_format() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("full-x.tar.gz.enc");
        fs::write(&artifact, b"hello").unwrap();
        let service = ChecksumService::new("sha256sum");
        let digest = service.generate(&artifact).unwrap();

        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let sidecar = fs::read_to_string(dir.path().join("full-x.tar.gz.enc.sha256sum")).unwrap();
        assert_eq!(sidecar, format!("{digest}  full-x.tar.gz.enc\n"));
        assert!(service.verify(&artifact).unwrap());
    }

    #[test]
    fn modified_artifact_fails_verification() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.enc");
        fs::write(&artifact, b"original").unwrap();
        let service = ChecksumService::new("sha256sum");
        service.generate(&artifact).unwrap();
        fs::write(&artifact, b"tampered").unwrap();

        let v = service.check(&artifact).unwrap();
        assert!(!v.matches());
        assert!(!service.verify(&artifact).unwrap());
    }

    #[test]
    fn missing_sidecar_is_an_error_not_a_mismatch() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.enc");
        fs::write(&artifact, b"data").unwrap();
        let err = ChecksumService::new("sha256sum").verify(&artifact).unwrap_err();
        assert!(matches!(err, ChecksumError::MissingSidecar { .. }));
    }

    #[test]
    fn garbled_sidecar_is_malformed() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("a.enc");
        fs::write(&artifact, b"data").unwrap();
        fs::write(dir.path().join("a.enc.sha256sum"), "xyz  a.enc\n").unwrap();
        let err = ChecksumService::new("sha256sum").verify(&artifact).unwrap_err();
        assert!(matches!(err, ChecksumError::MalformedSidecar { .. }));
    }
}
