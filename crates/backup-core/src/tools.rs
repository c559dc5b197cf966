//! The seam between the engine and external programs.
//!
//! Dumps, database discovery and the gpg cipher backend all go through
//! [`ToolRunner`], so tests can substitute a fake and never spawn a process.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_LIMIT: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} did not finish within {timeout:?} and was killed")]
    TimedOut { program: String, timeout: Duration },
    #[error("I/O while running {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// Send stdout to this file instead of capturing it.
    pub stdout_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            stdout_file: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout_file = Some(path);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Empty when stdout was redirected to a file.
    pub stdout: Vec<u8>,
    pub stderr: String,
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError>;
}

/// Runs commands as child processes with a hard deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput, ToolError> {
        debug!(program = %cmd.program, args = ?cmd.args, "spawning tool");
        let io_err = |source: std::io::Error| ToolError::Io {
            program: cmd.program.clone(),
            source,
        };

        let stdout = match &cmd.stdout_file {
            Some(path) => Stdio::from(File::create(path).map_err(io_err)?),
            None => Stdio::piped(),
        };
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        // Feed stdin and drain the pipes on helper threads so a chatty child
        // cannot block on a full pipe while we wait for it.
        let stdin_task = match (child.stdin.take(), cmd.stdin.clone()) {
            (Some(mut pipe), Some(data)) => Some(thread::spawn(move || {
                let result = pipe.write_all(&data);
                drop(pipe);
                result
            })),
            _ => None,
        };
        let stdout_task = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });
        let stderr_task = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let status = wait_with_deadline(&mut child, cmd.timeout).map_err(io_err)?;

        let stderr_bytes = join_reader(stderr_task);
        let stdout_bytes = join_reader(stdout_task);
        if let Some(task) = stdin_task {
            if let Ok(Err(e)) = task.join() {
                // A child that exits before reading all input is judged by its status.
                warn!(program = %cmd.program, error = %e, "tool did not consume stdin");
            }
        }

        let stderr = truncate_lossy(&stderr_bytes);
        match status {
            None => Err(ToolError::TimedOut {
                program: cmd.program.clone(),
                timeout: cmd.timeout,
            }),
            Some(status) if !status.success() => Err(ToolError::Failed {
                program: cmd.program.clone(),
                status: status.to_string(),
                stderr,
            }),
            Some(_) => Ok(ToolOutput {
                stdout: stdout_bytes,
                stderr,
            }),
        }
    }
}

/// `Ok(None)` when the deadline passed; the child has been killed and reaped.
/// A timeout too large to represent as an `Instant` means no deadline.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn join_reader(task: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
    task.and_then(|t| t.join().ok())
        .and_then(|r| r.ok())
        .unwrap_or_default()
}

fn truncate_lossy(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= STDERR_LIMIT {
        return text.to_string();
    }
    let mut end = STDERR_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str, timeout: Duration) -> ToolCommand {
        ToolCommand::new("sh", timeout).arg("-c").arg(script)
    }

    #[test]
    fn captures_stdout() {
        let out = SystemToolRunner
            .run(&sh("printf 'alpha\\nbeta\\n'", Duration::from_secs(10)))
            .unwrap();
        assert_eq!(out.stdout, b"alpha\nbeta\n");
    }

    #[test]
    fn redirects_stdout_and_feeds_stdin() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let cmd = ToolCommand::new("cat", Duration::from_secs(10))
            .stdin(b"piped through".to_vec())
            .stdout_to(target.clone());
        let out = SystemToolRunner.run(&cmd).unwrap();
        assert!(out.stdout.is_empty());
        assert_eq!(std::fs::read(&target).unwrap(), b"piped through");
    }

    #[test]
    fn nonzero_exit_carries_stderr() {
        let err = SystemToolRunner
            .run(&sh("echo broken >&2; exit 3", Duration::from_secs(10)))
            .unwrap_err();
        match err {
            ToolError::Failed { stderr, .. } => assert_eq!(stderr, "broken"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slow_tool_is_killed() {
        let err = SystemToolRunner
            .run(&sh("exec sleep 5", Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }

    #[test]
    fn unbounded_timeout_still_runs() {
        let out = SystemToolRunner
            .run(&sh("echo done", Duration::MAX))
            .unwrap();
        assert_eq!(out.stdout, b"done\n");
        let out = SystemToolRunner
            .run(&sh("echo done", Duration::from_secs(u64::MAX)))
            .unwrap();
        assert_eq!(out.stdout, b"done\n");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = SystemToolRunner
            .run(&ToolCommand::new(
                "definitely-not-a-real-binary-7f3a",
                Duration::from_secs(1),
            ))
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
