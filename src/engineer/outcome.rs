//! What happens after an attempt: closing records on success, notifying and
//! escalating on failure.
//!
//! Every step is best-effort. A failed close or update is logged and the
//! remaining steps still run; the queue never stops on bookkeeping errors.

use tracing::{debug, info, instrument, warn};

use super::{Engineer, REMOTE};
use crate::config::OnConflict;
use crate::git::Vcs;
use crate::issues::{IssueUpdate, MrFields, NewIssue, TASK_TYPE, parse_mr_fields, set_mr_fields};
use crate::mail::MergeFailed;
use crate::runner::CommandRunner;
use crate::slot::ConflictSlot;
use crate::types::{FailureKind, IssueId, MergeRequest, ProcessResult};

/// Close reason recorded on merged MRs.
pub const MERGED_REASON: &str = "merged";

const UNKNOWN_SHA: &str = "unknown-sha";

/// Close reason for a conflict task the MR could not be blocked on.
const UNLINKED_TASK_REASON: &str = "could not block merge request on this task";

/// Title of the resolution task for a conflicted MR.
pub fn conflict_task_title(original: &str) -> String {
    format!("Resolve merge conflicts: {original}")
}

/// Body of the resolution task: metadata plus rebase instructions.
pub fn conflict_task_description(
    mr: &MergeRequest,
    conflict_sha: &str,
    retry_count: u32,
) -> String {
    let sha: String = conflict_sha.chars().take(8).collect();
    let issue = mr.source_issue.as_ref().map(IssueId::as_str).unwrap_or("");
    let (branch, target) = (&mr.branch, &mr.target);
    format!(
        "Resolve merge conflicts for branch {branch}

## Metadata
- Original MR: {id}
- Branch: {branch}
- Conflict with: {target}@{sha}
- Original issue: {issue}
- Retry count: {retry_count}

## Instructions
1. Check out the branch: git checkout {branch}
2. Rebase onto target: git rebase origin/{target}
3. Resolve conflicts in your editor
4. Complete the rebase: git add . && git rebase --continue
5. Force-push the resolved branch: git push -f
6. Close this task: bd close <this-task-id>

The Refinery will automatically retry the merge after you force-push.",
        id = mr.id,
    )
}

impl<V: Vcs, R: CommandRunner> Engineer<V, R> {
    /// Dispatches to [`Self::handle_success`] or [`Self::handle_failure`].
    pub async fn handle_result(&self, mr: &MergeRequest, result: &ProcessResult) {
        if result.success {
            self.handle_success(mr, result).await;
        } else {
            self.handle_failure(mr, result).await;
        }
    }

    #[instrument(skip_all, fields(mr = %mr.id))]
    pub async fn handle_success(&self, mr: &MergeRequest, result: &ProcessResult) {
        // Held while a conflict resolution for this rig was in flight.
        self.slots.release_best_effort(&self.slots.conflict_holder());

        self.record_merge_commit(mr, result);
        match self.issues.close(&mr.id, MERGED_REASON) {
            Ok(()) => info!("closed merge request"),
            Err(e) => warn!(error = %e, "failed to close merge request"),
        }

        if let Some(source) = &mr.source_issue {
            match self.issues.close(source, &format!("Merged in {}", mr.id)) {
                Ok(()) => {
                    info!(issue = %source, "closed source issue");
                    let convoys = self.convoys.issue_closed(source);
                    if !convoys.is_empty() {
                        debug!(issue = %source, convoys = convoys.len(), "checked convoys");
                    }
                }
                Err(e) => warn!(issue = %source, error = %e, "failed to close source issue"),
            }
        }

        if let Some(agent) = &mr.agent
            && let Err(e) = self.issues.update(agent, &IssueUpdate::active_mr(None))
        {
            warn!(agent = %agent, error = %e, "failed to clear agent active MR");
        }

        if self.config.delete_merged_branches && !mr.branch.is_empty() {
            match self.vcs.delete_branch(&mr.branch, true).await {
                Ok(()) => info!(branch = %mr.branch, "deleted merged branch"),
                Err(e) => warn!(branch = %mr.branch, error = %e, "failed to delete merged branch"),
            }
        }

        info!(
            commit = result.merge_commit.as_ref().map(|s| s.short()).unwrap_or(""),
            "merge complete"
        );
    }

    fn record_merge_commit(&self, mr: &MergeRequest, result: &ProcessResult) {
        let record = match self.issues.show(&mr.id) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "failed to fetch merge request for update");
                return;
            }
        };
        let mut fields = parse_mr_fields(&record.description).unwrap_or_else(|| MrFields {
            branch: mr.branch.clone(),
            target: mr.target.clone(),
            ..Default::default()
        });
        fields.merge_commit = result.merge_commit.clone();
        fields.close_reason = Some(MERGED_REASON.to_string());
        let description = set_mr_fields(&record.description, &fields);
        if let Err(e) = self.issues.update(&mr.id, &IssueUpdate::description(description)) {
            warn!(error = %e, "failed to record merge commit");
        }
    }

    #[instrument(skip_all, fields(mr = %mr.id))]
    pub async fn handle_failure(&self, mr: &MergeRequest, result: &ProcessResult) {
        let Some(kind) = result.failure_kind() else {
            return;
        };
        if !kind.notifies() {
            info!(error = result.error_text(), "slot contention, merge request stays queued");
            return;
        }

        let failed = MergeFailed {
            rig: self.rig.clone(),
            worker: mr.worker.clone(),
            branch: mr.branch.clone(),
            issue: mr
                .source_issue
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            target: mr.target.clone(),
            failure: kind,
            error: result.error_text().to_string(),
        };
        match self.notifier.send(&failed.to_message()) {
            Ok(()) => info!(worker = %mr.worker, failure = %kind, "notified witness of merge failure"),
            Err(e) => warn!(error = %e, "failed to send MERGE_FAILED"),
        }

        if kind == FailureKind::Conflict {
            if self.config.on_conflict == OnConflict::AutoRebase {
                debug!("auto_rebase is not supported, escalating to a resolution task");
            }
            self.escalate_conflict(mr).await;
        }

        warn!(error = result.error_text(), failure = %kind, "merge failed, queue continues");
    }

    /// Creates the resolution task for a conflicted MR and blocks the MR on it.
    ///
    /// Serialized through the merge slot: if another holder has it, the MR
    /// is left queued and `None` is returned. If the slot cannot be reached
    /// the task is created anyway. When the task cannot be created or the MR
    /// cannot be blocked on it, the slot is released and `None` is returned;
    /// a task left without its edge is closed so retries do not stack up
    /// duplicates.
    pub async fn escalate_conflict(&self, mr: &MergeRequest) -> Option<IssueId> {
        let acquired = match self.slots.try_acquire_conflict_slot() {
            ConflictSlot::Acquired(holder) => Some(holder),
            ConflictSlot::HeldBy(holder) => {
                info!(holder = %holder, "merge slot held, deferring conflict resolution");
                return None;
            }
            ConflictSlot::Unavailable => None,
        };

        let conflict_sha = match self.vcs.rev_parse(&format!("{REMOTE}/{}", mr.target)).await {
            Ok(sha) => sha.to_string(),
            Err(e) => {
                debug!(error = %e, "could not resolve target head");
                UNKNOWN_SHA.to_string()
            }
        };

        let original = match &mr.source_issue {
            Some(source) => self
                .issues
                .show(source)
                .map(|issue| issue.title)
                .unwrap_or_else(|_| source.to_string()),
            None if !mr.title.is_empty() => mr.title.clone(),
            None => mr.id.to_string(),
        };

        let retry_count = mr.retry_count.saturating_add(1);
        let new = NewIssue {
            title: conflict_task_title(&original),
            issue_type: TASK_TYPE.to_string(),
            priority: mr.priority.saturating_sub(1),
            description: conflict_task_description(mr, &conflict_sha, retry_count),
            actor: self.actor(),
        };

        let release = || {
            if let Some(holder) = &acquired {
                self.slots.release_best_effort(holder);
            }
        };

        let task = match self.issues.create(&new) {
            Ok(task) => {
                info!(task = %task.id, priority = task.priority, "created conflict resolution task");
                task.id
            }
            Err(e) => {
                warn!(error = %e, "failed to create conflict resolution task");
                release();
                return None;
            }
        };

        if let Err(e) = self.issues.add_dependency(&mr.id, &task) {
            warn!(task = %task, error = %e, "failed to block merge request on task");
            if let Err(e) = self.issues.close(&task, UNLINKED_TASK_REASON) {
                warn!(task = %task, error = %e, "failed to close unlinked conflict task");
            }
            release();
            return None;
        }
        info!(task = %task, "merge request blocked on conflict task");
        Some(task)
    }
}
