//! Runs the shell commands backing each switch.
//!
//! Query commands follow an exit-code convention:
//!
//! | exit code | state | ok    | meaning                                  |
//! |-----------|-------|-------|------------------------------------------|
//! | 0         | ON    | true  | switch is on                             |
//! | 1         | OFF   | false | confirmed off/unavailable, not a failure |
//! | other     | OFF   | false | command failed                           |

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code}")]
    Exit {
        command: String,
        code: i32,
        output: String,
    },

    #[error("`{command}` was terminated by a signal")]
    Killed { command: String, output: String },

    /// Query exited with code 1.
    #[error("`{command}` reported the switch as off/unavailable")]
    Unavailable { command: String, output: String },
}

impl ExecutorError {
    pub fn output(&self) -> &str {
        match self {
            ExecutorError::Spawn { .. } => "",
            ExecutorError::Exit { output, .. }
            | ExecutorError::Killed { output, .. }
            | ExecutorError::Unavailable { output, .. } => output,
        }
    }

    /// True for failures to run the command, false for the exit-code-1 report.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ExecutorError::Unavailable { .. })
    }
}

/// Result of a state query. `state` is always defined, even on failure.
#[derive(Debug)]
pub struct QueryReport {
    pub state: bool,
    pub output: String,
    pub result: Result<(), ExecutorError>,
}

impl QueryReport {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` to switch on (`on == true`) or off. Returns its output.
    async fn switch_on_off(&self, command: &str, on: bool) -> Result<String, ExecutorError>;

    async fn query_state(&self, command: &str) -> QueryReport;
}

/// Executes commands through `<shell> -c <command>`, capturing stdout and
/// stderr as one output string.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    async fn run(&self, command: &str) -> Result<(ExitStatus, String), ExecutorError> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExecutorError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(command, status = %output.status, "Command finished");
        Ok((output.status, combined))
    }
}

fn exit_error(command: &str, status: ExitStatus, output: String) -> ExecutorError {
    match status.code() {
        Some(code) => ExecutorError::Exit {
            command: command.to_string(),
            code,
            output,
        },
        None => ExecutorError::Killed {
            command: command.to_string(),
            output,
        },
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn switch_on_off(&self, command: &str, on: bool) -> Result<String, ExecutorError> {
        debug!(command, on, "Running switch command");
        let (status, output) = self.run(command).await?;
        if status.success() {
            Ok(output)
        } else {
            Err(exit_error(command, status, output))
        }
    }

    async fn query_state(&self, command: &str) -> QueryReport {
        let (status, output) = match self.run(command).await {
            Ok(done) => done,
            Err(e) => {
                return QueryReport {
                    state: false,
                    output: String::new(),
                    result: Err(e),
                }
            }
        };

        let result = match status.code() {
            Some(0) => Ok(()),
            Some(1) => Err(ExecutorError::Unavailable {
                command: command.to_string(),
                output: output.clone(),
            }),
            _ => Err(exit_error(command, status, output.clone())),
        };
        QueryReport {
            state: result.is_ok(),
            output,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn on_off_captures_combined_output() {
        let executor = ShellExecutor::default();
        let output = executor
            .switch_on_off("echo out; echo err 1>&2", true)
            .await
            .unwrap();
        assert_eq!(output, "out\nerr\n");
    }

    #[tokio::test]
    async fn on_off_nonzero_exit_is_failure() {
        let executor = ShellExecutor::default();
        let err = executor
            .switch_on_off("echo broken; exit 1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Exit { code: 1, .. }));
        assert_eq!(err.output(), "broken\n");
    }

    #[tokio::test]
    async fn query_exit_zero_reports_on() {
        let report = ShellExecutor::default().query_state("true").await;
        assert!(report.state);
        assert!(report.ok());
    }

    #[tokio::test]
    async fn query_exit_one_reports_off_and_unavailable() {
        let report = ShellExecutor::default().query_state("exit 1").await;
        assert!(!report.state);
        assert!(!report.ok());
        let err = report.result.unwrap_err();
        assert!(matches!(err, ExecutorError::Unavailable { .. }));
        assert!(!err.is_failure());
    }

    #[tokio::test]
    async fn query_other_exit_codes_are_failures() {
        let report = ShellExecutor::default().query_state("echo nope; exit 3").await;
        assert!(!report.state);
        assert_eq!(report.output, "nope\n");
        let err = report.result.unwrap_err();
        assert!(matches!(err, ExecutorError::Exit { code: 3, .. }));
        assert!(err.is_failure());
    }

    #[tokio::test]
    async fn missing_shell_is_spawn_error() {
        let report = ShellExecutor::new("/nonexistent/shell")
            .query_state("true")
            .await;
        assert!(!report.state);
        assert!(matches!(report.result, Err(ExecutorError::Spawn { .. })));
    }
}
