//! Version-control capability used by the merge pipeline.

use std::future::Future;

use chrono::{DateTime, FixedOffset};

use super::GitResult;
use crate::types::Sha;

/// A submodule whose pointer differs between two revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleChange {
    /// Submodule path relative to the repository root.
    pub path: String,
    /// Pointer before the change; `None` if the submodule was added.
    pub old_sha: Option<Sha>,
    /// Pointer after the change; `None` if the submodule was removed.
    pub new_sha: Option<Sha>,
}

/// Git operations against the refinery's worktree.
///
/// The pipeline is generic over this trait so tests can script outcomes;
/// [`super::GitRepo`] is the real implementation.
pub trait Vcs: Send + Sync {
    fn branch_exists(&self, branch: &str) -> impl Future<Output = GitResult<bool>> + Send;

    /// Whether `refs/remotes/<remote>/<branch>` exists.
    fn remote_tracking_branch_exists(
        &self,
        remote: &str,
        branch: &str,
    ) -> impl Future<Output = GitResult<bool>> + Send;

    fn checkout(&self, branch: &str) -> impl Future<Output = GitResult<()>> + Send;

    fn pull(&self, remote: &str, branch: &str) -> impl Future<Output = GitResult<()>> + Send;

    /// Files that would conflict if `branch` were merged into `target`.
    ///
    /// Leaves the worktree and index untouched.
    fn conflicting_files(
        &self,
        branch: &str,
        target: &str,
    ) -> impl Future<Output = GitResult<Vec<String>>> + Send;

    /// Submodule pointer changes `branch` introduces relative to `base`.
    fn submodule_changes(
        &self,
        base: &str,
        branch: &str,
    ) -> impl Future<Output = GitResult<Vec<SubmoduleChange>>> + Send;

    fn init_submodules(&self) -> impl Future<Output = GitResult<()>> + Send;

    /// Pushes `sha` from the submodule at `path` to that submodule's remote.
    fn push_submodule_commit(
        &self,
        path: &str,
        sha: &Sha,
        remote: &str,
    ) -> impl Future<Output = GitResult<()>> + Send;

    /// Squash-merges `branch` into the checked-out branch and commits.
    ///
    /// `commit_date` pins author and committer dates so that retrying the
    /// same squash on the same base yields the same commit.
    fn merge_squash(
        &self,
        branch: &str,
        message: &str,
        commit_date: Option<DateTime<FixedOffset>>,
    ) -> impl Future<Output = GitResult<()>> + Send;

    /// Paths with unresolved conflicts in the working tree.
    fn unmerged_files(&self) -> impl Future<Output = GitResult<Vec<String>>> + Send;

    fn abort_merge(&self) -> impl Future<Output = GitResult<()>> + Send;

    fn push(&self, remote: &str, branch: &str) -> impl Future<Output = GitResult<()>> + Send;

    fn reset_hard(&self, rev: &str) -> impl Future<Output = GitResult<()>> + Send;

    fn rev_parse(&self, rev: &str) -> impl Future<Output = GitResult<Sha>> + Send;

    /// Full message of the commit at the tip of `branch`.
    fn head_commit_message(&self, branch: &str) -> impl Future<Output = GitResult<String>> + Send;

    /// Committer date of the commit at the tip of `branch`.
    fn head_commit_date(
        &self,
        branch: &str,
    ) -> impl Future<Output = GitResult<DateTime<FixedOffset>>> + Send;

    fn delete_branch(&self, branch: &str, force: bool) -> impl Future<Output = GitResult<()>> + Send;
}

const SUBMODULE_MODE: &str = "160000";

/// Parses `git diff --raw --no-abbrev` output into submodule changes.
///
/// Raw lines look like `:160000 160000 <old> <new> M\tpath`. Entries where
/// neither side is a gitlink are ignored.
pub fn parse_submodule_changes(raw: &str) -> Vec<SubmoduleChange> {
    raw.lines()
        .filter_map(|line| {
            let (meta, path) = line.strip_prefix(':')?.split_once('\t')?;
            let mut parts = meta.split_whitespace();
            let old_mode = parts.next()?;
            let new_mode = parts.next()?;
            let old_sha = parts.next()?;
            let new_sha = parts.next()?;
            if old_mode != SUBMODULE_MODE && new_mode != SUBMODULE_MODE {
                return None;
            }
            let side = |mode: &str, sha: &str| {
                let sha = Sha::parse(sha).ok()?;
                (mode == SUBMODULE_MODE && !sha.is_null()).then_some(sha)
            };
            Some(SubmoduleChange {
                path: path.to_string(),
                old_sha: side(old_mode, old_sha),
                new_sha: side(new_mode, new_sha),
            })
        })
        .collect()
}

/// Parses `git merge-tree --write-tree --name-only --no-messages` output.
///
/// The first line is the resulting tree; conflicted paths follow, one per
/// line, until a blank line. Paths are deduplicated in first-seen order.
pub fn parse_merge_tree_conflicts(stdout: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in stdout.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if !files.iter().any(|f| f == line) {
            files.push(line.to_string());
        }
    }
    files
}
