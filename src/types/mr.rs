//! Merge request records as seen by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::IssueId;

/// A queued merge request, decoded from an issue-store record.
///
/// The structured fields (branch, target, worker, ...) live inside the
/// record's description; the rest (title, priority, timestamps, assignee)
/// are first-class record attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// The MR record's ID.
    pub id: IssueId,

    /// Source branch (e.g., `polecat/nux/gt-abc`).
    pub branch: String,

    /// Target branch (e.g., `main`).
    pub target: String,

    /// The work item being merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_issue: Option<IssueId>,

    /// Who did the work.
    pub worker: String,

    /// Which rig the MR belongs to.
    pub rig: String,

    pub title: String,

    /// Numeric priority: lower is more urgent, 0 is the most urgent level.
    pub priority: u32,

    /// The agent record that submitted this MR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<IssueId>,

    /// Number of conflict-resolution rounds this MR has been through.
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convoy_id: Option<IssueId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convoy_created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Who claimed this MR. `None` means unclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// The first still-open record blocking this MR, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<IssueId>,
}

impl MergeRequest {
    /// Returns true if some worker holds a claim on this MR (fresh or stale).
    pub fn is_claimed(&self) -> bool {
        self.assignee.as_deref().is_some_and(|a| !a.is_empty())
    }
}

/// An open MR together with branch-existence data, for queue health tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMr {
    #[serde(flatten)]
    pub mr: MergeRequest,

    /// Whether the MR branch exists in the local repository.
    pub branch_exists_local: bool,

    /// Whether the MR branch exists in the `origin/*` remote-tracking refs.
    pub branch_exists_remote: bool,
}
