use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::context::BackupContext;
use crate::discovery::is_safe_database_name;
use crate::tools::{ToolCommand, ToolError};

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("refusing to dump database with unsafe name {0:?}")]
    InvalidName(String),
    #[error("dump of {database} failed: {source}")]
    Tool {
        database: String,
        source: ToolError,
    },
    #[error("cannot compress dump of {database}: {source}")]
    Compress {
        database: String,
        source: io::Error,
    },
}

pub struct DumpService<'a> {
    ctx: &'a BackupContext,
}

impl<'a> DumpService<'a> {
    pub fn new(ctx: &'a BackupContext) -> Self {
        Self { ctx }
    }

    /// Write a gzip-compressed, single-transaction logical dump of `database`
    /// to `output` (conventionally `<db>.sql.gz`).
    pub fn dump(&self, database: &str, output: &Path) -> Result<(), DumpError> {
        if !is_safe_database_name(database) {
            return Err(DumpError::InvalidName(database.to_string()));
        }
        let db = &self.ctx.config.database;
        let raw = raw_dump_path(output);
        let cmd = ToolCommand::new(db.dump_program.clone(), self.ctx.config.tool_timeout())
            .args(db.extra_args.iter().cloned())
            .args(["--single-transaction", "--routines", "--triggers"])
            .arg(database)
            .stdout_to(raw.clone());

        let result = self
            .ctx
            .runner
            .run(&cmd)
            .map_err(|source| DumpError::Tool {
                database: database.to_string(),
                source,
            })
            .and_then(|_| {
                gzip_file(&raw, output).map_err(|source| DumpError::Compress {
                    database: database.to_string(),
                    source,
                })
            });
        let _ = fs::remove_file(&raw);

        match &result {
            Ok(()) => info!(database, output = %output.display(), "database dump created"),
            Err(e) => {
                let _ = fs::remove_file(output);
                error!(database, error = %e, "database dump failed");
            }
        }
        result
    }
}

fn raw_dump_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(".gz").to_string())
        .unwrap_or_else(|| "dump.sql".to_string());
    output.with_file_name(format!("{name}.raw"))
}

fn gzip_file(src: &Path, dest: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tools::{ToolOutput, ToolRunner};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Writes a fake dump to the redirect target, or fails for `broken_db`.
    struct FakeDumper;

    impl ToolRunner for FakeDumper {
        fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
            let db = cmd.args.last().cloned().unwrap_or_default();
            if db == "broken_db" {
                return Err(ToolError::Failed {
                    program: cmd.program.clone(),
                    status: "exit status: 2".into(),
                    stderr: "Unknown database".into(),
                });
            }
            let target = cmd.stdout_file.clone().expect("dump must redirect stdout");
            fs::write(target, format!("-- dump of {db}\nCREATE TABLE t (id INT);\n")).unwrap();
            Ok(ToolOutput::default())
        }
    }

    fn ctx() -> BackupContext {
        BackupContext::new(EngineConfig::default(), Arc::new(FakeDumper))
    }

    #[test]
    fn dump_is_gzipped() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("orthodoxmetrics_db.sql.gz");
        DumpService::new(&ctx()).dump("orthodoxmetrics_db", &out).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&out).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.starts_with("-- dump of orthodoxmetrics_db"));
        assert!(!dir.path().join("orthodoxmetrics_db.sql.raw").exists());
    }

    #[test]
    fn failed_dump_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("broken_db.sql.gz");
        let err = DumpService::new(&ctx()).dump("broken_db", &out).unwrap_err();
        assert!(matches!(err, DumpError::Tool { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_option_like_names() {
        let dir = tempdir().unwrap();
        let err = DumpService::new(&ctx())
            .dump("--all-databases", &dir.path().join("x.sql.gz"))
            .unwrap_err();
        assert!(matches!(err, DumpError::InvalidName(_)));
    }
}
