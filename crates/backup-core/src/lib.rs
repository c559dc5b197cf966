//! Backup lifecycle engine for the OrthodoxMetrics host.
//!
//! Produces encrypted full and differential backups of the configured file
//! trees and tenant databases, verifies them with SHA-256 sidecars, and prunes
//! them under a retention policy. Every operation takes an explicit
//! [`BackupContext`]; nothing is held as process-wide state.

pub mod archive;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dump;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod retention;
pub mod tools;

pub use catalog::{AdminResponse, BackupCatalog, BackupListing, StorageStats};
pub use config::EngineConfig;
pub use context::BackupContext;
pub use engine::{BackupEngine, BackupReport};
pub use error::{BackupError, Result};
pub use layout::BackupKind;
pub use retention::{CleanupReport, RetentionCleanupService};
