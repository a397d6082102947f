//! The per-attempt merge pipeline.
//!
//! ```text
//! verify branch -> checkout target -> pull -> conflict probe
//!   -> submodule sync -> tests -> squash merge -> [slot] push
//! ```
//!
//! Every failure is reported as a [`ProcessResult`]; nothing here is fatal
//! to the process. Steps that leave the worktree ahead of `origin` reset it
//! before returning, so the next attempt starts clean.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Engineer, REMOTE};
use crate::git::Vcs;
use crate::runner::{CommandRunner, RunError, validate_test_command};
use crate::slot::PushSlot;
use crate::types::{MergeRequest, ProcessResult};

impl<V: Vcs, R: CommandRunner> Engineer<V, R> {
    /// Runs the merge pipeline for one MR.
    #[instrument(skip_all, fields(mr = %mr.id, branch = %mr.branch, target = %mr.target))]
    pub async fn process(&self, mr: &MergeRequest, cancel: &CancellationToken) -> ProcessResult {
        info!(worker = %mr.worker, source = ?mr.source_issue, "processing merge request");
        let source = mr.source_issue.as_ref().map(|id| id.as_str());
        self.merge_branch(&mr.branch, &mr.target, source, cancel).await
    }

    async fn merge_branch(
        &self,
        branch: &str,
        target: &str,
        source_issue: Option<&str>,
        cancel: &CancellationToken,
    ) -> ProcessResult {
        match self.vcs.branch_exists(branch).await {
            Ok(true) => {}
            Ok(false) => return ProcessResult::failed(format!("branch {branch} not found locally")),
            Err(e) => return ProcessResult::failed(format!("failed to check branch {branch}: {e}")),
        }

        if let Err(e) = self.vcs.checkout(target).await {
            return ProcessResult::failed(format!("failed to checkout target {target}: {e}"));
        }
        if let Err(e) = self.vcs.pull(REMOTE, target).await {
            warn!(target, error = %e, "pull failed, continuing with local target");
        }

        match self.vcs.conflicting_files(branch, target).await {
            Ok(files) if files.is_empty() => {}
            Ok(files) => {
                return ProcessResult::conflict(format!("merge conflicts in: [{}]", files.join(", ")));
            }
            Err(e) => return ProcessResult::conflict(format!("conflict check failed: {e}")),
        }

        if let Some(failed) = self.sync_submodules(branch, target).await {
            return failed;
        }

        if self.config.run_tests
            && !self.config.test_command.is_empty()
            && let Some(failed) = self.run_tests(cancel).await
        {
            return failed;
        }

        let message = self.squash_message(branch, target, source_issue).await;
        let commit_date = match self.vcs.head_commit_date(branch).await {
            Ok(date) => Some(date),
            Err(e) => {
                warn!(branch, error = %e, "could not read branch head date, commit will use current time");
                None
            }
        };

        if let Err(e) = self.vcs.merge_squash(branch, &message, commit_date).await {
            let unmerged = self.vcs.unmerged_files().await.unwrap_or_default();
            if !unmerged.is_empty() {
                if let Err(abort) = self.vcs.abort_merge().await {
                    warn!(error = %abort, "failed to abort conflicted merge");
                }
                return ProcessResult::conflict("merge conflict during actual merge");
            }
            return ProcessResult::failed(format!("merge failed: {e}"));
        }

        let merge_commit = match self.vcs.rev_parse("HEAD").await {
            Ok(sha) => sha,
            Err(e) => return ProcessResult::failed(format!("failed to get merge commit SHA: {e}")),
        };

        let slot = if target == self.default_branch {
            match self.slots.acquire_push_slot(cancel).await {
                Ok(slot) => Some(slot),
                Err(e) => {
                    self.reset_to_origin(target).await;
                    let error = format!("failed to acquire merge slot before push: {e}");
                    return if e.is_contention_timeout() {
                        ProcessResult::slot_timeout(error)
                    } else {
                        ProcessResult::failed(error)
                    };
                }
            }
        } else {
            None
        };

        let pushed = self.vcs.push(REMOTE, target).await;
        if let Some(PushSlot::Acquired(holder)) = &slot {
            self.slots.release_best_effort(holder);
        }
        if let Err(e) = pushed {
            self.reset_to_origin(target).await;
            return ProcessResult::failed(format!("failed to push to origin: {e}"));
        }

        info!(commit = %merge_commit.short(), "merged and pushed");
        ProcessResult::merged(merge_commit)
    }

    /// Pushes submodule commits the branch points at, ahead of the parent merge.
    async fn sync_submodules(&self, branch: &str, target: &str) -> Option<ProcessResult> {
        let changes = match self.vcs.submodule_changes(target, branch).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(branch, error = %e, "submodule change detection failed, skipping sync");
                return None;
            }
        };
        if changes.is_empty() {
            return None;
        }

        if let Err(e) = self.vcs.init_submodules().await {
            warn!(error = %e, "submodule init failed");
            return Some(ProcessResult::failed(
                "failed to init submodules in refinery worktree",
            ));
        }
        for change in &changes {
            let Some(sha) = &change.new_sha else {
                debug!(submodule = %change.path, "submodule removed, nothing to push");
                continue;
            };
            if let Err(e) = self.vcs.push_submodule_commit(&change.path, sha, REMOTE).await {
                return Some(ProcessResult::failed(format!(
                    "failed to push submodule {}: {e}",
                    change.path
                )));
            }
        }
        None
    }

    /// Runs the configured test command. Returns `None` when tests pass.
    async fn run_tests(&self, cancel: &CancellationToken) -> Option<ProcessResult> {
        let command = &self.config.test_command;
        if let Err(e) = validate_test_command(command) {
            return Some(ProcessResult::failed(format!("invalid test command: {e}")));
        }

        let attempts = self.config.test_attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Some(ProcessResult::failed("test run canceled"));
            }
            info!(attempt, attempts, command = %command, "running tests");
            match self
                .runner
                .run(command, &self.workdir, self.config.test_timeout, cancel)
                .await
            {
                Ok(output) if output.success => return None,
                Ok(output) => last_error = output.failure_summary(),
                Err(RunError::Cancelled) => return Some(ProcessResult::failed("test run canceled")),
                Err(e @ RunError::EmptyCommand) => {
                    return Some(ProcessResult::failed(format!("invalid test command: {e}")));
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(attempt, attempts, error = %last_error, "test attempt failed");
        }

        Some(ProcessResult::tests_failed(format!(
            "tests failed after {attempts} attempts: {last_error}"
        )))
    }

    /// The squash commit message: the branch head's message, or a synthesized one.
    async fn squash_message(&self, branch: &str, target: &str, source_issue: Option<&str>) -> String {
        match self.vcs.head_commit_message(branch).await {
            Ok(message) if !message.trim().is_empty() => message.trim_end().to_string(),
            result => {
                if let Err(e) = result {
                    warn!(branch, error = %e, "could not read branch head message");
                }
                let mut message = format!("Squash merge {branch} into {target}");
                if let Some(issue) = source_issue.filter(|s| !s.is_empty()) {
                    message.push_str(&format!(" ({issue})"));
                }
                message
            }
        }
    }

    async fn reset_to_origin(&self, target: &str) {
        let origin = format!("{REMOTE}/{target}");
        if let Err(e) = self.vcs.reset_hard(&origin).await {
            warn!(rev = %origin, error = %e, "failed to reset target after aborted push");
        }
    }
}
