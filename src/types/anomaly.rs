//! Queue health signals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::IssueId;

/// What kind of queue problem an anomaly reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// The MR is claimed but its record has not been touched for hours.
    StaleClaim,
    /// The MR branch no longer exists locally or on the remote.
    OrphanedBranch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// An MR queue problem that can stall processing.
///
/// Derived on every scan; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrAnomaly {
    pub id: IssueId,
    pub branch: String,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub age: Option<Duration>,
    pub detail: String,
}
