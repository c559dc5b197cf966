use anyhow::Result;
use backup_core::{BackupContext, BackupEngine, BackupKind};
use backup_service::{bootstrap, exit_code, parse_args, print_json};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "OrthodoxMetrics backup engine", long_about = None)]
struct Cli {
    /// Backup type: `full` or `diff`
    kind: BackupKind,
    /// JSON configuration file (overrides $BACKUP_ENGINE_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli: Cli = parse_args();
    let config = bootstrap(cli.config.as_deref())?;
    let engine = BackupEngine::new(BackupContext::with_system_tools(config));
    let report = engine.execute_backup(cli.kind);
    print_json(&report)?;
    Ok(exit_code(report.success))
}
