use anyhow::{Context, Result};
use backup_core::catalog::{default_restore_name, VerifyStatus};
use backup_core::{AdminResponse, BackupCatalog, BackupContext, BackupKind};
use backup_service::{bootstrap, exit_code, parse_args, print_json};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and manage stored backups", long_about = None)]
struct Cli {
    /// JSON configuration file (overrides $BACKUP_ENGINE_CONFIG)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stored backups, newest first
    List,
    /// Recompute an artifact's digest and compare it with its sidecar
    Verify { id: String },
    /// Delete an artifact and its checksum file
    Delete { id: String },
    /// Filesystem and backup storage usage
    Stats,
    /// Run a backup on a worker thread and wait for its report
    Trigger { kind: BackupKind },
    /// Decrypt an artifact to a plaintext .tar.gz
    Decrypt { artifact: PathBuf, output: PathBuf },
}

fn main() -> Result<ExitCode> {
    let cli: Cli = parse_args();
    let config = bootstrap(cli.config.as_deref())?;
    let catalog = BackupCatalog::new(BackupContext::with_system_tools(config));

    match cli.command {
        Commands::List => {
            let listings = catalog.list_backups().context("cannot list backups")?;
            print_json(&listings)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { id } => {
            let report = catalog
                .verify_backup(&id)
                .with_context(|| format!("cannot verify {id}"))?;
            print_json(&report)?;
            Ok(exit_code(report.status == VerifyStatus::Verified))
        }
        Commands::Delete { id } => {
            let response = catalog.delete_backup(&id);
            print_json(&response)?;
            Ok(exit_code(response.success))
        }
        Commands::Stats => {
            let stats = catalog.storage_stats().context("cannot read storage usage")?;
            print_json(&stats)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Trigger { kind } => {
            let accepted = catalog.trigger_backup(kind);
            if !accepted.success {
                print_json(&json!({ "trigger": accepted }))?;
                return Ok(ExitCode::FAILURE);
            }
            let report = catalog.wait_for_trigger();
            let success = report.as_ref().map(|r| r.success).unwrap_or(false);
            print_json(&json!({ "trigger": accepted, "report": report }))?;
            Ok(exit_code(success))
        }
        Commands::Decrypt { artifact, output } => {
            let output = default_restore_name(&artifact, &output);
            let response = match catalog.decrypt_backup(&artifact, &output) {
                Ok(()) => AdminResponse {
                    success: true,
                    message: format!("decrypted to {}", output.display()),
                },
                Err(e) => AdminResponse {
                    success: false,
                    message: e.to_string(),
                },
            };
            print_json(&response)?;
            Ok(exit_code(response.success))
        }
    }
}
