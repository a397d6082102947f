//! Local git operations for the refinery worktree.
//!
//! - [`vcs`]: the [`Vcs`] capability trait the merge pipeline is written against
//! - [`repo`]: [`GitRepo`], the implementation that shells out to `git`
//!
//! Every command runs with a clean environment (no system or global config,
//! no terminal prompts) and under a caller-supplied timeout, so a wedged
//! remote or a credential prompt cannot stall the queue.

pub mod repo;
pub mod vcs;

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::types::InvalidSha;

pub use repo::GitRepo;
pub use vcs::{SubmoduleChange, Vcs, parse_merge_tree_conflicts, parse_submodule_changes};

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command exited unsuccessfully.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Git command did not finish within its timeout.
    #[error("git command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },

    #[error(transparent)]
    InvalidSha(#[from] InvalidSha),

    /// The command succeeded but printed something we could not interpret.
    #[error("unexpected output from {command}: {output:?}")]
    UnexpectedOutput { command: String, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Identity used for creating commits.
///
/// Passed via `-c` flags so commits can be created even though global and
/// system git config are disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    /// git `user.name`.
    pub name: String,

    /// git `user.email`.
    pub email: String,
}

impl CommitIdentity {
    /// The identity the refinery commits squash merges as.
    pub fn refinery(rig: &str) -> Self {
        CommitIdentity {
            name: format!("{rig}/refinery"),
            email: "refinery@localhost".to_string(),
        }
    }
}

/// Creates a git command with a clean environment.
pub(crate) fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);

    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    cmd.kill_on_drop(true);
    cmd
}

/// Creates a git command with commit identity passed via `-c`.
pub(crate) fn git_commit_command(workdir: &Path, identity: &CommitIdentity) -> Command {
    let mut cmd = git_command(workdir);
    cmd.arg("-c");
    cmd.arg(format!("user.name={}", identity.name));
    cmd.arg("-c");
    cmd.arg(format!("user.email={}", identity.email));
    cmd
}

/// Runs a prepared command to completion under `timeout`.
///
/// Returns the output whatever the exit status; callers decide what a
/// non-zero exit means.
pub(crate) async fn output_with_timeout(
    cmd: &mut Command,
    display: &str,
    timeout: Duration,
) -> GitResult<Output> {
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(GitError::Timeout {
            command: display.to_string(),
            after: timeout,
        }),
    }
}

/// Runs `git <args>` and fails on a non-zero exit.
pub async fn run_git(workdir: &Path, args: &[&str], timeout: Duration) -> GitResult<Output> {
    let display = format!("git {}", args.join(" "));
    let output = output_with_timeout(git_command(workdir).args(args), &display, timeout).await?;
    check_success(display, output)
}

/// Runs `git <args>` and returns trimmed stdout.
pub async fn run_git_stdout(workdir: &Path, args: &[&str], timeout: Duration) -> GitResult<String> {
    let output = run_git(workdir, args, timeout).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub(crate) fn check_success(command: String, output: Output) -> GitResult<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(GitError::CommandFailed { command, stderr })
    }
}

/// Maps a `git show-ref --verify --quiet` style exit code to a boolean.
///
/// Exit 0 means present, exit 1 means absent, anything else is an error.
pub(crate) fn exists_from_exit(command: String, output: Output) -> GitResult<bool> {
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(GitError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn failed_command_reports_command_and_stderr() {
        let dir = tempdir().unwrap();
        let err = run_git(dir.path(), &["rev-parse", "HEAD"], Duration::from_secs(30))
            .await
            .unwrap_err();
        match err {
            GitError::CommandFailed { command, stderr } => {
                assert_eq!(command, "git rev-parse HEAD");
                assert!(!stderr.is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdout_is_trimmed() {
        let dir = tempdir().unwrap();
        run_git(dir.path(), &["init", "-q"], Duration::from_secs(30))
            .await
            .unwrap();
        let out = run_git_stdout(
            dir.path(),
            &["rev-parse", "--is-inside-work-tree"],
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(out, "true");
    }

    #[test]
    fn refinery_identity_is_rig_scoped() {
        let id = CommitIdentity::refinery("gastown");
        assert_eq!(id.name, "gastown/refinery");
    }
}
