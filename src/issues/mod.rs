//! Issue/dependency store interface.
//!
//! Merge requests, their source issues, conflict-resolution tasks and agent
//! records are all records in one shared issue store. The refinery only needs
//! a narrow slice of it: listing by type and status, showing, updating,
//! closing with a reason, creating, and adding dependency edges.
//!
//! MR-specific structure (branch, target, worker, ...) is embedded in the
//! record's free-text description; see [`fields`].

pub mod fields;
pub mod file;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::PersistError;
use crate::types::IssueId;

pub use fields::{MrFields, parse_mr_fields, set_mr_fields, strip_mr_fields};
pub use file::FileStore;

/// Issue type of queued merge requests.
pub const MERGE_REQUEST_TYPE: &str = "merge-request";

/// Issue type of conflict-resolution tasks.
pub const TASK_TYPE: &str = "task";

/// Label marking MRs that must never be processed by the queue.
pub const EXEMPT_LABEL: &str = "gt:owned-direct";

/// Errors from the issue store.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("issue not found: {0}")]
    NotFound(IssueId),

    #[error("issue store error: {0}")]
    Persist(#[from] PersistError),

    /// Any other backend failure (unreachable store, permission denied, ...).
    #[error("issue store backend: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, IssueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Closed,
}

/// A record in the issue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: IssueStatus,
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// RFC 3339 timestamp, as recorded by the store.
    ///
    /// Kept as text: stores written by other tools may carry values that do
    /// not parse, and callers decide how to treat those.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    /// Records this one depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<IssueId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// For agent records: the MR the agent is currently waiting on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_mr: Option<IssueId>,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == IssueStatus::Closed
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Returns the assignee, treating an empty string as unassigned.
    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref().filter(|a| !a.is_empty())
    }
}

/// Filter for [`IssueStore::list`]. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueQuery {
    pub issue_type: Option<String>,
    pub status: Option<IssueStatus>,
    pub label: Option<String>,
}

impl IssueQuery {
    /// Open merge requests.
    pub fn open_merge_requests() -> Self {
        IssueQuery {
            issue_type: Some(MERGE_REQUEST_TYPE.to_string()),
            status: Some(IssueStatus::Open),
            label: None,
        }
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        self.issue_type
            .as_deref()
            .is_none_or(|t| issue.issue_type == t)
            && self.status.is_none_or(|s| issue.status == s)
            && self.label.as_deref().is_none_or(|l| issue.has_label(l))
    }
}

/// A partial update. `None` leaves the attribute unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueUpdate {
    /// `Some(None)` clears the assignee.
    pub assignee: Option<Option<String>>,
    pub description: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    /// `Some(None)` clears the agent's active MR.
    pub active_mr: Option<Option<IssueId>>,
}

impl IssueUpdate {
    pub fn assignee(assignee: Option<String>) -> Self {
        IssueUpdate {
            assignee: Some(assignee),
            ..Default::default()
        }
    }

    pub fn description(description: impl Into<String>) -> Self {
        IssueUpdate {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn active_mr(active_mr: Option<IssueId>) -> Self {
        IssueUpdate {
            active_mr: Some(active_mr),
            ..Default::default()
        }
    }
}

/// Parameters for [`IssueStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub issue_type: String,
    pub priority: u32,
    pub description: String,
    /// Who is creating the record (e.g., `gastown/refinery`).
    pub actor: String,
}

/// The issue store as the refinery sees it.
///
/// Implementations must be safe to share across tasks; the refinery holds
/// them as `Arc<dyn IssueStore>`.
pub trait IssueStore: Send + Sync {
    /// Lists records matching `query`.
    fn list(&self, query: &IssueQuery) -> Result<Vec<Issue>>;

    /// Fetches one record. Unknown IDs yield [`IssueError::NotFound`].
    fn show(&self, id: &IssueId) -> Result<Issue>;

    /// Fetches several records, skipping IDs that do not exist.
    fn show_many(&self, ids: &[IssueId]) -> Result<Vec<Issue>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.show(id) {
                Ok(issue) => found.push(issue),
                Err(IssueError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    fn update(&self, id: &IssueId, update: &IssueUpdate) -> Result<()>;

    /// Closes a record, recording why.
    fn close(&self, id: &IssueId, reason: &str) -> Result<()>;

    /// Records that `issue` is blocked until `depends_on` closes.
    fn add_dependency(&self, issue: &IssueId, depends_on: &IssueId) -> Result<()>;

    fn create(&self, new: &NewIssue) -> Result<Issue>;
}

/// Returns whether `id` names a record that is not closed.
///
/// A record that cannot be fetched counts as closed, so a dangling
/// dependency edge never wedges the queue.
pub fn is_open(store: &dyn IssueStore, id: &IssueId) -> bool {
    match store.show(id) {
        Ok(issue) => !issue.is_closed(),
        Err(e) => {
            tracing::debug!(issue = %id, error = %e, "blocker lookup failed, treating as closed");
            false
        }
    }
}

/// Returns the first blocker of `issue` that is still open.
pub fn first_open_blocker(store: &dyn IssueStore, issue: &Issue) -> Option<IssueId> {
    issue
        .blocked_by
        .iter()
        .find(|id| is_open(store, id))
        .cloned()
}
