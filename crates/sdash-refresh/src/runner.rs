//! Subprocess execution for the scheduler tools.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const STDERR_LIMIT: usize = 400;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{program} not found on PATH")]
    NotFound { program: String },
    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} timed out after {}s", .after.as_secs_f64())]
    Timeout { program: String, after: Duration },
    #[error("{program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} output not recognized: {message}")]
    Parse { program: String, message: String },
}

impl CommandError {
    /// A missing executable will not come back during this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::NotFound { .. })
    }

    pub fn program(&self) -> &str {
        match self {
            CommandError::NotFound { program }
            | CommandError::Failed { program, .. }
            | CommandError::Timeout { program, .. }
            | CommandError::Io { program, .. }
            | CommandError::Parse { program, .. } => program,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

/// Runs one external command and returns its stdout. Implementations never
/// retry.
pub trait CommandRunner: Send + Sync + 'static {
    /// Locates `program` without running it.
    fn resolve(&self, program: &str) -> Option<PathBuf>;

    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<String, CommandError>> + Send;
}

/// Spawns real processes. Executables are looked up once and remembered.
#[derive(Debug, Default)]
pub struct SystemRunner {
    search_path: Option<OsString>,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks executables up in `search_path` instead of `$PATH`.
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        if program.contains('/') {
            let path = Path::new(program);
            return path.is_file().then(|| path.to_path_buf());
        }
        let path_var = match &self.search_path {
            Some(value) => value.clone(),
            None => std::env::var_os("PATH")?,
        };
        std::env::split_paths(&path_var)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

impl CommandRunner for SystemRunner {
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        let mut cache = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = cache.get(program) {
            return Some(path.clone());
        }
        let path = self.lookup(program)?;
        debug!("executable_resolved: {program} -> {}", path.display());
        cache.insert(program.to_string(), path.clone());
        Some(path)
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let path = self.resolve(program).ok_or_else(|| CommandError::NotFound {
            program: program.to_string(),
        })?;

        let mut child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Io {
                program: program.to_string(),
                source,
            })?;

        let outcome = tokio::time::timeout(timeout, collect_output(&mut child)).await;
        let output = match outcome {
            Ok(result) => result.map_err(|source| CommandError::Io {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!("command_kill_failed: {program}: {err}");
                }
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    after: timeout,
                });
            }
        };

        let (status, stdout, stderr) = output;
        if !status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                code: status.code(),
                stderr: clip(String::from_utf8_lossy(&stderr).trim(), STDERR_LIMIT),
            });
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

async fn collect_output(
    child: &mut Child,
) -> io::Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let read_stdout = async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, io::Error>(buf)
    };
    let read_stderr = async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, io::Error>(buf)
    };
    let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
    let status = child.wait().await?;
    Ok((status, stdout, stderr))
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_executables_are_fatal() {
        assert!(CommandError::NotFound {
            program: "squeue".to_string()
        }
        .is_fatal());
        assert!(!CommandError::Timeout {
            program: "squeue".to_string(),
            after: Duration::from_secs(5),
        }
        .is_fatal());
    }

    #[test]
    fn failure_message_names_program_and_status() {
        let err = CommandError::Failed {
            program: "sacct".to_string(),
            code: Some(1),
            stderr: "slurmdbd unreachable".to_string(),
        };
        assert_eq!(err.to_string(), "sacct exited with status 1: slurmdbd unreachable");
        assert_eq!(err.program(), "sacct");
    }

    #[test]
    fn stderr_is_clipped() {
        let long = "x".repeat(500);
        let clipped = clip(&long, 10);
        assert_eq!(clipped, "xxxxxxx...");
        assert_eq!(clip("short", 10), "short");
    }

    #[test]
    fn missing_program_does_not_resolve() {
        let runner = SystemRunner::with_search_path("/nonexistent-sdash-dir");
        assert!(runner.resolve("squeue").is_none());
    }
}
