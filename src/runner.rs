//! Test command execution.
//!
//! The configured test command comes from the rig's operator-controlled
//! config and runs through `sh -c` in the refinery worktree. It never
//! mutates the refinery's own process environment.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("test command must not be empty")]
    EmptyCommand,

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("failed to spawn command: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Rejects blank test commands.
pub fn validate_test_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        Err(RunError::EmptyCommand)
    } else {
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A one-line failure summary: exit status plus the last stderr line.
    pub fn failure_summary(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => format!("{status}: {}", last.trim()),
            None => status,
        }
    }
}

/// Runs shell commands on behalf of the merge pipeline.
pub trait CommandRunner: Send + Sync {
    /// Runs `command` in `workdir`, giving up after `timeout` or when
    /// `cancel` fires.
    fn run(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        validate_test_command(command)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(workdir).kill_on_drop(true);

        // Dropping the output future kills the child.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            res = tokio::time::timeout(timeout, cmd.output()) => match res {
                Ok(output) => output?,
                Err(_) => return Err(RunError::Timeout(timeout)),
            },
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn blank_commands_are_rejected() {
        assert!(matches!(validate_test_command(""), Err(RunError::EmptyCommand)));
        assert!(matches!(validate_test_command("  \t"), Err(RunError::EmptyCommand)));
        assert!(validate_test_command("cargo test").is_ok());
    }

    #[tokio::test]
    async fn captures_success_and_output() {
        let dir = tempdir().unwrap();
        let out = ShellRunner
            .run(
                "echo hello && pwd",
                dir.path(),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.code, Some(0));
        assert!(out.stdout.starts_with("hello\n"));
    }

    #[tokio::test]
    async fn reports_failure_with_last_stderr_line() {
        let dir = tempdir().unwrap();
        let out = ShellRunner
            .run(
                "echo first >&2; echo 'assertion failed' >&2; exit 3",
                dir.path(),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.failure_summary(), "exit status 3: assertion failed");
    }

    #[tokio::test]
    async fn times_out() {
        let dir = tempdir().unwrap();
        let err = ShellRunner
            .run(
                "sleep 5",
                dir.path(),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = ShellRunner
            .run("sleep 5", dir.path(), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
