use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "BACKUP_ENGINE_CONFIG";
pub const ROOT_ENV: &str = "BACKUP_ROOT";
pub const KEY_FILE_ENV: &str = "BACKUP_KEY_FILE";
pub const LOG_FILE_ENV: &str = "BACKUP_LOG_FILE";

/// A century of differentials.
pub const MAX_DIFFERENTIAL_AGE_DAYS: i64 = 36_500;
/// One week per external tool invocation.
pub const MAX_TOOL_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CipherBackend {
    AesGcm,
    Gpg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub client_program: String,
    pub dump_program: String,
    /// Passed to both the client and the dump program, e.g. `--defaults-file=...`.
    pub extra_args: Vec<String>,
    pub core_databases: Vec<String>,
    /// SQL `LIKE` pattern naming tenant databases.
    pub tenant_pattern: String,
    pub discovery_enabled: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            client_program: "mysql".into(),
            dump_program: "mysqldump".into(),
            extra_args: vec![],
            core_databases: vec!["orthodoxmetrics_db".into()],
            tenant_pattern: "%-church_db".into(),
            discovery_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    pub backend: CipherBackend,
    pub gpg_program: String,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            backend: CipherBackend::AesGcm,
            gpg_program: "gpg".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_full_backups: usize,
    pub max_differential_age_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_full_backups: 4,
            max_differential_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backup_root: PathBuf,
    pub log_file: PathBuf,
    pub key_file: PathBuf,
    /// Where per-run database dumps are staged; the system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    pub filesystem_targets: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub database: DatabaseSettings,
    pub encryption: EncryptionSettings,
    pub digest_extension: String,
    pub retention: RetentionPolicy,
    pub tool_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/backups"),
            log_file: PathBuf::from("/var/log/om-backup.log"),
            key_file: PathBuf::from("/root/.om_backup_key"),
            staging_dir: None,
            filesystem_targets: vec![
                PathBuf::from("/var/www/orthodox-church-mgmt/"),
                PathBuf::from("/opt/om-frontend/"),
                PathBuf::from("/etc/pm2/"),
                PathBuf::from("/root/.pm2/"),
            ],
            exclude_patterns: vec![
                "node_modules".into(),
                ".git".into(),
                "*.log".into(),
                "temp".into(),
                "uploads/temp".into(),
            ],
            database: DatabaseSettings::default(),
            encryption: EncryptionSettings::default(),
            digest_extension: "sha256sum".into(),
            retention: RetentionPolicy::default(),
            tool_timeout_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Resolve the effective configuration: defaults, then the JSON file named
    /// by `explicit` or `$BACKUP_ENGINE_CONFIG`, then the path env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Some(root) = non_empty_env(ROOT_ENV) {
            self.backup_root = PathBuf::from(root);
        }
        if let Some(key) = non_empty_env(KEY_FILE_ENV) {
            self.key_file = PathBuf::from(key);
        }
        if let Some(log) = non_empty_env(LOG_FILE_ENV) {
            self.log_file = PathBuf::from(log);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.max_full_backups == 0 {
            return Err(ConfigError::Invalid(
                "retention.max_full_backups must be at least 1".into(),
            ));
        }
        if !(0..=MAX_DIFFERENTIAL_AGE_DAYS).contains(&self.retention.max_differential_age_days) {
            return Err(ConfigError::Invalid(format!(
                "retention.max_differential_age_days must be between 0 and {MAX_DIFFERENTIAL_AGE_DAYS}"
            )));
        }
        if !(1..=MAX_TOOL_TIMEOUT_SECS).contains(&self.tool_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "tool_timeout_secs must be between 1 and {MAX_TOOL_TIMEOUT_SECS}"
            )));
        }
        for pattern in &self.exclude_patterns {
            let trimmed = pattern.trim().trim_matches('/');
            if !trimmed.is_empty() && trimmed.chars().all(|c| c == '*') {
                return Err(ConfigError::Invalid(format!(
                    "exclude pattern {pattern:?} would exclude everything"
                )));
            }
        }
        if self.digest_extension.is_empty() || self.digest_extension.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "digest_extension {:?} is not a valid file extension",
                self.digest_extension
            )));
        }
        if self.backup_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("backup_root is empty".into()));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
