//! Persistent symmetric key for backup encryption.
//!
//! The key is 32 random bytes stored hex-encoded on a single line in a file
//! only the owning account can read. Once a key exists it is never replaced
//! automatically: every archive encrypted so far depends on it, so any problem
//! reading it aborts the run instead of generating a new one.

use rand::RngCore;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::layout::staging_path_for;

pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file {path} exists but cannot be read: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },
    #[error("cannot create key file {path}: {source}")]
    Create {
        path: String,
        source: std::io::Error,
    },
}

pub struct EncryptionKey {
    hex: Zeroizing<String>,
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
        let hex = Zeroizing::new(hex::encode(&bytes[..]));
        Self { hex, bytes }
    }

    pub fn from_hex(encoded: &str) -> Result<Self, String> {
        let decoded = Zeroizing::new(hex::decode(encoded).map_err(|e| e.to_string())?);
        if decoded.len() != KEY_LEN {
            return Err(format!(
                "expected {} key bytes, found {}",
                KEY_LEN,
                decoded.len()
            ));
        }
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(&decoded);
        Ok(Self {
            hex: Zeroizing::new(encoded.to_ascii_lowercase()),
            bytes,
        })
    }

    pub fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Hex form, used as the passphrase for the gpg backend.
    pub fn passphrase(&self) -> &str {
        &self.hex
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_create(&self) -> Result<EncryptionKey, KeyError> {
        match self.load()? {
            Some(key) => Ok(key),
            None => self.create(),
        }
    }

    /// For restores: a missing key is an error, never a reason to create one.
    pub fn load_existing(&self) -> Result<EncryptionKey, KeyError> {
        self.load()?.ok_or_else(|| KeyError::Unreadable {
            path: self.path.display().to_string(),
            source: std::io::Error::new(ErrorKind::NotFound, "no key file"),
        })
    }

    /// `Ok(None)` only when the file does not exist.
    fn load(&self) -> Result<Option<EncryptionKey>, KeyError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(KeyError::Unreadable {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        let key = EncryptionKey::from_hex(contents.trim()).map_err(|reason| KeyError::Malformed {
            path: self.path.display().to_string(),
            reason,
        })?;
        self.tighten_permissions();
        info!(path = %self.path.display(), "encryption key loaded from file");
        Ok(Some(key))
    }

    fn create(&self) -> Result<EncryptionKey, KeyError> {
        let create_err = |source: std::io::Error| KeyError::Create {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(create_err)?;
            }
        }

        let key = EncryptionKey::generate();
        let staging = staging_path_for(&self.path);
        let written = write_private(&staging, key.passphrase().as_bytes());
        if let Err(source) = written {
            let _ = fs::remove_file(&staging);
            return Err(create_err(source));
        }

        // hard_link refuses to overwrite, so a key written by a concurrent
        // first run wins and we adopt it.
        let linked = fs::hard_link(&staging, &self.path);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => {
                info!(path = %self.path.display(), "new encryption key generated");
                Ok(key)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %self.path.display(), "key file created concurrently; using it");
                self.load()?.ok_or_else(|| KeyError::Unreadable {
                    path: self.path.display().to_string(),
                    source: std::io::Error::new(ErrorKind::NotFound, "key file vanished"),
                })
            }
            Err(source) => Err(create_err(source)),
        }
    }

    fn tighten_permissions(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let Ok(meta) = fs::metadata(&self.path) else {
                return;
            };
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(path = %self.path.display(), mode = %format!("{mode:o}"), "key file readable by others; restricting to 0600");
                if let Err(e) = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)) {
                    warn!(path = %self.path.display(), error = %e, "cannot restrict key file permissions");
                }
            }
        }
    }
}

fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
