//! The merge queue: which MRs are ready, which are blocked, and claims.
//!
//! Ready MRs are open merge-request records that
//! - carry MR fields in their description,
//! - are not labelled [`EXEMPT_LABEL`],
//! - are unclaimed, or claimed with a stale claim,
//! - have no still-open blocker,
//!
//! ranked by [`crate::scoring`].

pub mod claim;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::git::Vcs;
use crate::issues::{
    self, EXEMPT_LABEL, Issue, IssueQuery, IssueStore, IssueUpdate, MrFields, parse_mr_fields,
};
use crate::scoring;
use crate::types::{IssueId, MergeRequest, OpenMr};

pub use claim::{claim_is_stale, parse_timestamp};

/// A ready MR with the score it was ranked by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMr {
    #[serde(flatten)]
    pub mr: MergeRequest,
    pub score: f64,
}

/// Builds the queue view of an MR record.
pub fn issue_to_mr(issue: &Issue, fields: &MrFields) -> MergeRequest {
    MergeRequest {
        id: issue.id.clone(),
        branch: fields.branch.clone(),
        target: fields.target.clone(),
        source_issue: fields.source_issue.clone(),
        worker: fields.worker.clone(),
        rig: fields.rig.clone(),
        title: issue.title.clone(),
        priority: issue.priority,
        agent: fields.agent_bead.clone(),
        retry_count: fields.retry_count,
        convoy_id: fields.convoy_id.clone(),
        convoy_created_at: fields.convoy_created_at(),
        created_at: parse_timestamp(issue.created_at.as_deref()),
        updated_at: parse_timestamp(issue.updated_at.as_deref()),
        assignee: issue.assignee().map(str::to_string),
        blocked_by: None,
    }
}

/// Merge queue over an issue store.
pub struct MergeQueue {
    store: Arc<dyn IssueStore>,
    stale_claim_timeout: Duration,
}

impl MergeQueue {
    pub fn new(store: Arc<dyn IssueStore>, stale_claim_timeout: Duration) -> Self {
        MergeQueue {
            store,
            stale_claim_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn IssueStore> {
        &self.store
    }

    fn open_mr_records(&self) -> issues::Result<Vec<(Issue, MrFields)>> {
        let records = self.store.list(&IssueQuery::open_merge_requests())?;
        Ok(records
            .into_iter()
            .filter(Issue::is_open)
            .filter_map(|issue| {
                let fields = parse_mr_fields(&issue.description)?;
                Some((issue, fields))
            })
            .collect())
    }

    /// Whether a claim on `issue` still excludes it from the queue.
    fn claim_is_live(&self, issue: &Issue, now: DateTime<Utc>) -> bool {
        let Some(assignee) = issue.assignee() else {
            return false;
        };
        match claim_is_stale(issue.updated_at.as_deref(), self.stale_claim_timeout, now) {
            Ok(false) => true,
            Ok(true) => {
                info!(
                    mr = %issue.id,
                    assignee,
                    updated_at = issue.updated_at.as_deref().unwrap_or(""),
                    "stale claim detected, eligible for re-claim"
                );
                false
            }
            Err(e) => {
                warn!(
                    mr = %issue.id,
                    error = %e,
                    "could not parse updated_at, treating claim as valid"
                );
                true
            }
        }
    }

    /// Ready MRs with their scores, best first.
    pub fn list_ready_scored(&self, now: DateTime<Utc>) -> issues::Result<Vec<ScoredMr>> {
        let mut ready = Vec::new();
        for (issue, fields) in self.open_mr_records()? {
            if issue.has_label(EXEMPT_LABEL) {
                info!(mr = %issue.id, "skipping MR labelled {EXEMPT_LABEL}");
                continue;
            }
            if self.claim_is_live(&issue, now) {
                continue;
            }
            if issues::first_open_blocker(self.store.as_ref(), &issue).is_some() {
                continue;
            }
            ready.push(issue_to_mr(&issue, &fields));
        }

        scoring::rank(&mut ready, now);
        Ok(ready
            .into_iter()
            .map(|mr| {
                let score = scoring::score_mr(&mr, now);
                ScoredMr { mr, score }
            })
            .collect())
    }

    /// Ready MRs, best first.
    pub fn list_ready(&self, now: DateTime<Utc>) -> issues::Result<Vec<MergeRequest>> {
        Ok(self
            .list_ready_scored(now)?
            .into_iter()
            .map(|scored| scored.mr)
            .collect())
    }

    /// Open MRs held back by a still-open blocker, with that blocker's ID.
    pub fn list_blocked(&self) -> issues::Result<Vec<MergeRequest>> {
        let mut blocked = Vec::new();
        for (issue, fields) in self.open_mr_records()? {
            if issue.blocked_by.is_empty() {
                continue;
            }
            let Some(blocker) = issues::first_open_blocker(self.store.as_ref(), &issue) else {
                continue;
            };
            let mut mr = issue_to_mr(&issue, &fields);
            mr.blocked_by = Some(blocker);
            blocked.push(mr);
        }
        Ok(blocked)
    }

    /// Every open MR, unfiltered, with branch existence.
    ///
    /// Branch lookups that fail report the branch as absent.
    pub async fn list_all_open<V: Vcs>(&self, vcs: &V) -> issues::Result<Vec<OpenMr>> {
        let mut out = Vec::new();
        for (issue, fields) in self.open_mr_records()? {
            let mut mr = issue_to_mr(&issue, &fields);
            mr.blocked_by = issues::first_open_blocker(self.store.as_ref(), &issue);
            let branch_exists_local = vcs.branch_exists(&fields.branch).await.unwrap_or(false);
            let branch_exists_remote = vcs
                .remote_tracking_branch_exists("origin", &fields.branch)
                .await
                .unwrap_or(false);
            out.push(OpenMr {
                mr,
                branch_exists_local,
                branch_exists_remote,
            });
        }
        Ok(out)
    }

    /// Claims an MR for `worker` by setting its assignee.
    pub fn claim(&self, id: &IssueId, worker: &str) -> issues::Result<()> {
        self.store
            .update(id, &IssueUpdate::assignee(Some(worker.to_string())))
    }

    /// Returns a claimed MR to the queue by clearing its assignee.
    pub fn release(&self, id: &IssueId) -> issues::Result<()> {
        self.store.update(id, &IssueUpdate::assignee(None))
    }
}
