use anyhow::Result;
use backup_core::{BackupContext, RetentionCleanupService};
use backup_service::{bootstrap, exit_code, parse_args, print_json};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Apply the backup retention policy", long_about = None)]
struct Cli {
    /// JSON configuration file (overrides $BACKUP_ENGINE_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli: Cli = parse_args();
    let config = bootstrap(cli.config.as_deref())?;
    let report = RetentionCleanupService::new(BackupContext::with_system_tools(config)).execute_cleanup();
    print_json(&report)?;
    Ok(exit_code(report.success))
}
