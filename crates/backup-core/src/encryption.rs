//! Symmetric encryption of finished archives.
//!
//! Two backends sit behind [`ArtifactCipher`]:
//!
//! * `aes-gcm` (default, extension `enc`): AES-256-GCM over 64 KiB chunks.
//!   Layout is `OMBKENC1 | nonce prefix (7) | chunk*`, each chunk sealed with
//!   nonce `prefix | counter (u32 BE) | last-flag` and the 15-byte header as
//!   associated data. Every chunk except the last carries exactly 64 KiB of
//!   plaintext, so reordering, truncation and appended data all fail to
//!   authenticate.
//! * `gpg` (extension `gpg`): `gpg --symmetric --cipher-algo AES256` with the
//!   hex key fed as passphrase on stdin, for artifacts that must be readable
//!   with stock tooling.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::CipherBackend;
use crate::context::BackupContext;
use crate::keystore::EncryptionKey;
use crate::layout::staging_path_for;
use crate::tools::{ToolCommand, ToolError, ToolRunner};

const MAGIC: &[u8; 8] = b"OMBKENC1";
const PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = MAGIC.len() + PREFIX_LEN;
const CHUNK_LEN: usize = 64 * 1024;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("I/O on {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("{path} is not an encrypted backup: {reason}")]
    Format { path: String, reason: String },
    #[error("{path} failed authentication (wrong key, truncated or tampered)")]
    Authentication { path: String },
    #[error("cipher failure: {0}")]
    Cipher(String),
}

pub trait ArtifactCipher: Send + Sync {
    /// Appended to the archive name, without the dot.
    fn extension(&self) -> &'static str;
    fn encrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError>;
    fn decrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError>;
}

fn io_err(path: &Path) -> impl Fn(io::Error) -> EncryptionError + '_ {
    move |source| EncryptionError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

impl AesGcmCipher {
    fn cipher(key: &EncryptionKey) -> Result<Aes256Gcm, EncryptionError> {
        Aes256Gcm::new_from_slice(key.bytes()).map_err(|e| EncryptionError::Cipher(e.to_string()))
    }
}

fn chunk_nonce(prefix: &[u8], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..PREFIX_LEN].copy_from_slice(prefix);
    nonce[PREFIX_LEN..PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Fill `buf` as far as the reader allows; short only at end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl ArtifactCipher for AesGcmCipher {
    fn extension(&self) -> &'static str {
        "enc"
    }

    fn encrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError> {
        let cipher = Self::cipher(key)?;
        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        rand::rngs::OsRng.fill_bytes(&mut header[MAGIC.len()..]);
        let prefix = &header[MAGIC.len()..];

        let mut reader = BufReader::new(File::open(input).map_err(io_err(input))?);
        let mut writer = BufWriter::new(File::create(output).map_err(io_err(output))?);
        writer.write_all(&header).map_err(io_err(output))?;

        let mut buf = vec![0u8; CHUNK_LEN];
        let mut counter: u32 = 0;
        loop {
            let n = read_full(&mut reader, &mut buf).map_err(io_err(input))?;
            let last = n < CHUNK_LEN;
            let nonce = chunk_nonce(prefix, counter, last);
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buf[..n],
                        aad: &header,
                    },
                )
                .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
            writer.write_all(&sealed).map_err(io_err(output))?;
            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| EncryptionError::Cipher("archive too large for chunk counter".into()))?;
        }
        writer.flush().map_err(io_err(output))?;
        Ok(())
    }

    fn decrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError> {
        let cipher = Self::cipher(key)?;
        let format_err = |reason: &str| EncryptionError::Format {
            path: input.display().to_string(),
            reason: reason.to_string(),
        };
        let auth_err = || EncryptionError::Authentication {
            path: input.display().to_string(),
        };

        let mut reader = BufReader::new(File::open(input).map_err(io_err(input))?);
        let mut header = [0u8; HEADER_LEN];
        if read_full(&mut reader, &mut header).map_err(io_err(input))? < HEADER_LEN
            || &header[..MAGIC.len()] != MAGIC
        {
            return Err(format_err("missing header"));
        }
        let prefix = &header[MAGIC.len()..];

        let mut writer = BufWriter::new(File::create(output).map_err(io_err(output))?);
        let mut buf = vec![0u8; CHUNK_LEN + TAG_LEN];
        let mut counter: u32 = 0;
        loop {
            let n = read_full(&mut reader, &mut buf).map_err(io_err(input))?;
            if n < TAG_LEN {
                return Err(auth_err());
            }
            let last = n < buf.len();
            let nonce = chunk_nonce(prefix, counter, last);
            let plain = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buf[..n],
                        aad: &header,
                    },
                )
                .map_err(|_| auth_err())?;
            writer.write_all(&plain).map_err(io_err(output))?;
            if last {
                break;
            }
            counter = counter.checked_add(1).ok_or_else(auth_err)?;
        }
        writer.flush().map_err(io_err(output))?;
        Ok(())
    }
}

pub struct GpgCipher {
    runner: Arc<dyn ToolRunner>,
    program: String,
    timeout: std::time::Duration,
}

impl GpgCipher {
    pub fn new(ctx: &BackupContext) -> Self {
        Self {
            runner: ctx.runner.clone(),
            program: ctx.config.encryption.gpg_program.clone(),
            timeout: ctx.config.tool_timeout(),
        }
    }

    fn command(&self, mode: &[&str], input: &Path, output: &Path, key: &EncryptionKey) -> ToolCommand {
        let mut passphrase = key.passphrase().as_bytes().to_vec();
        passphrase.push(b'\n');
        ToolCommand::new(self.program.clone(), self.timeout)
            .args(["--batch", "--yes", "--pinentry-mode", "loopback", "--passphrase-fd", "0"])
            .args(mode.iter().copied())
            .arg("--output")
            .arg(output.display().to_string())
            .arg(input.display().to_string())
            .stdin(passphrase)
    }
}

impl ArtifactCipher for GpgCipher {
    fn extension(&self) -> &'static str {
        "gpg"
    }

    fn encrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError> {
        let cmd = self.command(&["--symmetric", "--cipher-algo", "AES256"], input, output, key);
        self.runner.run(&cmd)?;
        Ok(())
    }

    fn decrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError> {
        let cmd = self.command(&["--decrypt"], input, output, key);
        self.runner.run(&cmd)?;
        Ok(())
    }
}

/// The configured backend.
pub fn cipher_for(ctx: &BackupContext) -> Arc<dyn ArtifactCipher> {
    match ctx.config.encryption.backend {
        CipherBackend::AesGcm => Arc::new(AesGcmCipher),
        CipherBackend::Gpg => Arc::new(GpgCipher::new(ctx)),
    }
}

/// The backend that produced a file with this extension, whatever the
/// current configuration says.
pub fn cipher_for_extension(ctx: &BackupContext, extension: &str) -> Option<Arc<dyn ArtifactCipher>> {
    match extension {
        "enc" => Some(Arc::new(AesGcmCipher)),
        "gpg" => Some(Arc::new(GpgCipher::new(ctx))),
        _ => None,
    }
}

pub struct EncryptionService {
    cipher: Arc<dyn ArtifactCipher>,
}

impl EncryptionService {
    pub fn new(cipher: Arc<dyn ArtifactCipher>) -> Self {
        Self { cipher }
    }

    pub fn extension(&self) -> &'static str {
        self.cipher.extension()
    }

    /// Encrypt `plaintext` to `<plaintext>.<ext>` and delete the plaintext.
    ///
    /// On failure the plaintext is left where it is and no partial output
    /// remains, so an operator can still recover the archive.
    pub fn encrypt(&self, plaintext: &Path, key: &EncryptionKey) -> Result<PathBuf, EncryptionError> {
        let mut name = plaintext.as_os_str().to_os_string();
        name.push(".");
        name.push(self.cipher.extension());
        let output = PathBuf::from(name);

        if let Err(e) = self.seal_into(plaintext, &output, key, Direction::Encrypt) {
            error!(path = %plaintext.display(), error = %e, "encryption failed; plaintext archive kept");
            return Err(e);
        }
        match fs::remove_file(plaintext) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                error!(path = %plaintext.display(), error = %source, "cannot remove plaintext archive");
                if let Err(e) = fs::remove_file(&output) {
                    warn!(path = %output.display(), error = %e, "cannot remove encrypted artifact");
                }
                return Err(io_err(plaintext)(source));
            }
        }
        info!(path = %output.display(), "archive encrypted");
        Ok(output)
    }

    pub fn decrypt(&self, encrypted: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError> {
        self.seal_into(encrypted, output, key, Direction::Decrypt)?;
        info!(source = %encrypted.display(), output = %output.display(), "archive decrypted");
        Ok(())
    }

    fn seal_into(
        &self,
        input: &Path,
        output: &Path,
        key: &EncryptionKey,
        direction: Direction,
    ) -> Result<(), EncryptionError> {
        let staging = staging_path_for(output);
        let result = match direction {
            Direction::Encrypt => self.cipher.encrypt_file(input, &staging, key),
            Direction::Decrypt => self.cipher.decrypt_file(input, &staging, key),
        }
        .and_then(|()| {
            File::open(&staging)
                .and_then(|f| f.sync_all())
                .and_then(|()| fs::rename(&staging, output))
                .map_err(io_err(output))
        });
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        result
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tools::ToolOutput;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn key(byte: u8) -> EncryptionKey {
        EncryptionKey::from_hex(&hex::encode([byte; 32])).unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn round_trip(len: usize) {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("full.tar.gz");
        let data = sample(len);
        fs::write(&plain, &data).unwrap();

        let service = EncryptionService::new(Arc::new(AesGcmCipher));
        let encrypted = service.encrypt(&plain, &key(7)).unwrap();
        assert_eq!(encrypted, dir.path().join("full.tar.gz.enc"));
        assert!(!plain.exists());

        let restored = dir.path().join("restored.tar.gz");
        service.decrypt(&encrypted, &restored, &key(7)).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn round_trips_across_chunk_boundaries() {
        round_trip(0);
        round_trip(10);
        round_trip(CHUNK_LEN);
        round_trip(CHUNK_LEN * 2 + 123);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("a.tar.gz");
        fs::write(&plain, sample(1000)).unwrap();
        let service = EncryptionService::new(Arc::new(AesGcmCipher));
        let encrypted = service.encrypt(&plain, &key(1)).unwrap();

        let out = dir.path().join("out");
        let err = service.decrypt(&encrypted, &out, &key(2)).unwrap_err();
        assert!(matches!(err, EncryptionError::Authentication { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn dropping_the_final_chunk_is_detected() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("a.tar.gz");
        fs::write(&plain, sample(CHUNK_LEN + 50)).unwrap();
        let service = EncryptionService::new(Arc::new(AesGcmCipher));
        let encrypted = service.encrypt(&plain, &key(3)).unwrap();

        let bytes = fs::read(&encrypted).unwrap();
        fs::write(&encrypted, &bytes[..HEADER_LEN + CHUNK_LEN + TAG_LEN]).unwrap();
        let err = service
            .decrypt(&encrypted, &dir.path().join("out"), &key(3))
            .unwrap_err();
        assert!(matches!(err, EncryptionError::Authentication { .. }));
    }

    #[test]
    fn foreign_file_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.enc");
        fs::write(&path, b"definitely not ours").unwrap();
        let err = AesGcmCipher
            .decrypt_file(&path, &dir.path().join("out"), &key(1))
            .unwrap_err();
        assert!(matches!(err, EncryptionError::Format { .. }));
    }

    struct FailingCipher;

    impl ArtifactCipher for FailingCipher {
        fn extension(&self) -> &'static str {
            "enc"
        }
        fn encrypt_file(&self, _: &Path, output: &Path, _: &EncryptionKey) -> Result<(), EncryptionError> {
            fs::write(output, b"half").unwrap();
            Err(EncryptionError::Cipher("disk full".into()))
        }
        fn decrypt_file(&self, _: &Path, _: &Path, _: &EncryptionKey) -> Result<(), EncryptionError> {
            unreachable!()
        }
    }

    #[test]
    fn failed_encryption_keeps_plaintext_only() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("full.tar.gz");
        fs::write(&plain, b"archive").unwrap();
        let err = EncryptionService::new(Arc::new(FailingCipher))
            .encrypt(&plain, &key(1))
            .unwrap_err();
        assert!(matches!(err, EncryptionError::Cipher(_)));
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["full.tar.gz"]);
    }

    /// Seals correctly, then leaves something at the plaintext path that
    /// `remove_file` cannot delete.
    struct StickyPlaintextCipher;

    impl ArtifactCipher for StickyPlaintextCipher {
        fn extension(&self) -> &'static str {
            "enc"
        }
        fn encrypt_file(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<(), EncryptionError> {
            AesGcmCipher.encrypt_file(input, output, key)?;
            fs::remove_file(input).unwrap();
            fs::create_dir(input).unwrap();
            fs::write(input.join("payload"), b"archive").unwrap();
            Ok(())
        }
        fn decrypt_file(&self, _: &Path, _: &Path, _: &EncryptionKey) -> Result<(), EncryptionError> {
            unreachable!()
        }
    }

    #[test]
    fn undeletable_plaintext_fails_encryption() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("full.tar.gz");
        fs::write(&plain, b"archive").unwrap();
        let err = EncryptionService::new(Arc::new(StickyPlaintextCipher))
            .encrypt(&plain, &key(2))
            .unwrap_err();
        assert!(matches!(err, EncryptionError::Io { .. }), "{err:?}");
        assert!(!dir.path().join("full.tar.gz.enc").exists());
        assert!(plain.exists());
    }

    #[derive(Default)]
    struct RecordingRunner(Mutex<Vec<ToolCommand>>);

    impl ToolRunner for RecordingRunner {
        fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
            let output = cmd.args.get(cmd.args.len() - 2).cloned().unwrap_or_default();
            fs::write(output, b"gpg-data").unwrap();
            self.0.lock().push(cmd.clone());
            Ok(ToolOutput::default())
        }
    }

    #[test]
    fn gpg_backend_passes_key_on_stdin() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("diff.tar.gz");
        fs::write(&plain, b"archive").unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let ctx = BackupContext::new(EngineConfig::default(), runner.clone());
        let k = key(9);

        let encrypted = EncryptionService::new(Arc::new(GpgCipher::new(&ctx)))
            .encrypt(&plain, &k)
            .unwrap();
        assert_eq!(encrypted, dir.path().join("diff.tar.gz.gpg"));
        assert_eq!(fs::read(&encrypted).unwrap(), b"gpg-data");

        let calls = runner.0.lock();
        let cmd = &calls[0];
        assert_eq!(cmd.program, "gpg");
        assert!(cmd.args.iter().any(|a| a == "--symmetric"));
        assert!(cmd.args.windows(2).any(|w| w == ["--cipher-algo", "AES256"]));
        assert!(!cmd.args.iter().any(|a| a.contains(k.passphrase())));
        assert_eq!(
            cmd.stdin.as_deref(),
            Some(format!("{}\n", k.passphrase()).as_bytes())
        );
    }
}
