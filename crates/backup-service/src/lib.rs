//! Shared plumbing for the `backup-engine`, `backup-cleanup` and
//! `backup-admin` binaries.

use anyhow::{Context, Result};
use backup_core::config::EngineConfig;
use backup_core::logging::init_logging;
use clap::error::ErrorKind;
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;

/// Parse the command line. Usage errors exit with status 1 (not clap's 2);
/// `--help` and `--version` exit 0.
pub fn parse_args<C: Parser>() -> C {
    match C::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

/// Resolve the configuration and install logging to its log file.
pub fn bootstrap(config_path: Option<&Path>) -> Result<EngineConfig> {
    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(None);
            return Err(e).context("cannot load backup configuration");
        }
    };
    init_logging(Some(&config.log_file));
    Ok(config)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("cannot serialise result")?;
    println!("{out}");
    Ok(())
}

pub fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
