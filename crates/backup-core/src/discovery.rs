//! Works out what a run backs up: configured paths that exist right now, plus
//! the core databases and whatever tenant databases the server reports.

use std::path::PathBuf;
use tracing::{info, warn};

use crate::context::BackupContext;
use crate::tools::{ToolCommand, ToolError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupTargets {
    pub filesystem_paths: Vec<PathBuf>,
    pub databases: Vec<String>,
}

pub struct TargetDiscovery<'a> {
    ctx: &'a BackupContext,
}

impl<'a> TargetDiscovery<'a> {
    pub fn new(ctx: &'a BackupContext) -> Self {
        Self { ctx }
    }

    /// Never fails: a discovery problem is logged and the static database
    /// list is used on its own.
    pub fn discover_targets(&self) -> BackupTargets {
        let filesystem_paths = self.existing_paths();
        let mut databases: Vec<String> = Vec::new();
        for name in &self.ctx.config.database.core_databases {
            if !databases.contains(name) {
                databases.push(name.clone());
            }
        }

        if self.ctx.config.database.discovery_enabled {
            match self.query_tenant_databases() {
                Ok(found) => {
                    for name in found {
                        if !databases.contains(&name) {
                            databases.push(name);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "database discovery failed; using the static database list");
                }
            }
        }

        info!(
            paths = filesystem_paths.len(),
            databases = %databases.join(", "),
            "backup targets discovered"
        );
        BackupTargets {
            filesystem_paths,
            databases,
        }
    }

    fn existing_paths(&self) -> Vec<PathBuf> {
        self.ctx
            .config
            .filesystem_targets
            .iter()
            .filter(|p| {
                let exists = p.exists();
                if !exists {
                    info!(path = %p.display(), "backup target missing; skipped");
                }
                exists
            })
            .cloned()
            .collect()
    }

    fn query_tenant_databases(&self) -> Result<Vec<String>, ToolError> {
        let db = &self.ctx.config.database;
        let query = format!(
            "SHOW DATABASES LIKE '{}'",
            db.tenant_pattern.replace('\\', "\\\\").replace('\'', "\\'")
        );
        let cmd = ToolCommand::new(db.client_program.clone(), self.ctx.config.tool_timeout())
            .args(db.extra_args.iter().cloned())
            .args(["--batch", "--skip-column-names", "-e"])
            .arg(query);
        let output = self.ctx.runner.run(&cmd)?;
        Ok(parse_database_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// One database per line. The `Database (...)` header is dropped in case the
/// client ignores `--skip-column-names`; unsafe names are rejected.
pub fn parse_database_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Database"))
        .filter(|name| {
            let ok = is_safe_database_name(name);
            if !ok {
                warn!(name = %name, "ignoring database with unexpected name");
            }
            ok
        })
        .map(str::to_string)
        .collect()
}

pub fn is_safe_database_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tools::{ToolOutput, ToolRunner};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct CannedRunner(Result<&'static str, ()>);

    impl ToolRunner for CannedRunner {
        fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
            match self.0 {
                Ok(stdout) => Ok(ToolOutput {
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: String::new(),
                }),
                Err(()) => Err(ToolError::Failed {
                    program: cmd.program.clone(),
                    status: "exit status: 1".into(),
                    stderr: "Access denied".into(),
                }),
            }
        }
    }

    fn context(runner: CannedRunner, targets: Vec<PathBuf>) -> BackupContext {
        let config = EngineConfig {
            filesystem_targets: targets,
            ..EngineConfig::default()
        };
        BackupContext::new(config, Arc::new(runner))
    }

    #[test]
    fn parses_client_output() {
        let names = parse_database_list("Database (%-church_db)\nstnick-church_db\n\n  holy-trinity-church_db \n--drop\n");
        assert_eq!(names, vec!["stnick-church_db", "holy-trinity-church_db"]);
    }

    #[test]
    fn merges_discovered_with_core_databases() {
        let ctx = context(
            CannedRunner(Ok("orthodoxmetrics_db\nstnick-church_db\n")),
            vec![],
        );
        let targets = TargetDiscovery::new(&ctx).discover_targets();
        assert_eq!(targets.databases, vec!["orthodoxmetrics_db", "stnick-church_db"]);
    }

    #[test]
    fn discovery_failure_degrades_to_static_list() {
        let ctx = context(CannedRunner(Err(())), vec![]);
        let targets = TargetDiscovery::new(&ctx).discover_targets();
        assert_eq!(targets.databases, vec!["orthodoxmetrics_db"]);
    }

    #[test]
    fn only_existing_paths_are_kept() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("www");
        std::fs::create_dir(&present).unwrap();
        let ctx = context(
            CannedRunner(Ok("")),
            vec![present.clone(), dir.path().join("gone")],
        );
        let targets = TargetDiscovery::new(&ctx).discover_targets();
        assert_eq!(targets.filesystem_paths, vec![present]);
    }
}
