//! Queue health scan: stale claims and orphaned branches.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::git::Vcs;
use crate::issues::{Issue, parse_mr_fields};
use crate::queue::parse_timestamp;
use crate::types::{AnomalyKind, MrAnomaly, Severity};

/// Claims untouched this long are reported as warnings.
pub const STALE_CLAIM_WARNING: Duration = Duration::from_secs(2 * 60 * 60);

/// Claims untouched this long are reported as critical.
pub const STALE_CLAIM_CRITICAL: Duration = Duration::from_secs(6 * 60 * 60);

const STALE_CLAIM_DETAIL: &str = "MR is claimed but not progressing";
const ORPHANED_BRANCH_DETAIL: &str = "MR branch is missing locally and in origin/* tracking refs";

/// Input for a single anomaly check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalyInput<'a> {
    pub id: &'a str,
    pub branch: &'a str,
    pub assignee: Option<&'a str>,
    /// Raw `updated_at` from the store.
    pub updated_at: Option<&'a str>,
    pub branch_exists_local: bool,
    pub branch_exists_remote: bool,
    /// Set if either branch lookup failed; suppresses the orphan signal.
    pub branch_check_failed: bool,
}

/// Reports a stale claim, if `assignee` has held it past the warning threshold.
///
/// Unparseable or future timestamps never produce an anomaly.
pub fn stale_claim_anomaly(input: &AnomalyInput<'_>, now: DateTime<Utc>) -> Option<MrAnomaly> {
    let assignee = input.assignee.filter(|a| !a.is_empty())?;
    let updated = parse_timestamp(input.updated_at)?;
    let age = (now - updated).to_std().ok()?;
    let severity = if age >= STALE_CLAIM_CRITICAL {
        Severity::Critical
    } else if age >= STALE_CLAIM_WARNING {
        Severity::Warning
    } else {
        return None;
    };
    Some(MrAnomaly {
        id: input.id.into(),
        branch: input.branch.to_string(),
        kind: AnomalyKind::StaleClaim,
        severity,
        assignee: Some(assignee.to_string()),
        age: Some(Duration::from_secs(age.as_secs())),
        detail: STALE_CLAIM_DETAIL.to_string(),
    })
}

/// Reports an orphaned branch when both lookups succeeded and found nothing.
pub fn orphaned_branch_anomaly(input: &AnomalyInput<'_>) -> Option<MrAnomaly> {
    if input.branch_check_failed || input.branch_exists_local || input.branch_exists_remote {
        return None;
    }
    Some(MrAnomaly {
        id: input.id.into(),
        branch: input.branch.to_string(),
        kind: AnomalyKind::OrphanedBranch,
        severity: Severity::Critical,
        assignee: None,
        age: None,
        detail: ORPHANED_BRANCH_DETAIL.to_string(),
    })
}

/// All anomalies for one MR, stale claim first.
pub fn detect(input: &AnomalyInput<'_>, now: DateTime<Utc>) -> Vec<MrAnomaly> {
    stale_claim_anomaly(input, now)
        .into_iter()
        .chain(orphaned_branch_anomaly(input))
        .collect()
}

/// Raw record data needed to scan one open MR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRecord {
    pub id: String,
    pub branch: String,
    pub assignee: Option<String>,
    pub updated_at: Option<String>,
    pub open: bool,
}

impl ScanRecord {
    /// Builds a scan record from an MR issue. The branch comes from the
    /// description fields and is empty if there are none.
    pub fn from_issue(issue: &Issue) -> Self {
        ScanRecord {
            id: issue.id.to_string(),
            branch: parse_mr_fields(&issue.description)
                .map(|f| f.branch)
                .unwrap_or_default(),
            assignee: issue.assignee().map(str::to_string),
            updated_at: issue.updated_at.clone(),
            open: issue.is_open(),
        }
    }
}

/// Scans open MRs, checking branch existence through `vcs`.
///
/// Records that are not open or that carry no branch are skipped.
pub async fn detect_queue_anomalies<V: Vcs>(
    records: &[ScanRecord],
    now: DateTime<Utc>,
    vcs: &V,
) -> Vec<MrAnomaly> {
    let mut anomalies = Vec::new();
    for record in records {
        if !record.open || record.branch.is_empty() {
            continue;
        }
        let local = vcs.branch_exists(&record.branch).await;
        let remote = vcs
            .remote_tracking_branch_exists("origin", &record.branch)
            .await;
        if let Err(e) = &local {
            debug!(mr = %record.id, branch = %record.branch, error = %e, "local branch check failed");
        }
        if let Err(e) = &remote {
            debug!(mr = %record.id, branch = %record.branch, error = %e, "remote branch check failed");
        }
        let input = AnomalyInput {
            id: &record.id,
            branch: &record.branch,
            assignee: record.assignee.as_deref(),
            updated_at: record.updated_at.as_deref(),
            branch_check_failed: local.is_err() || remote.is_err(),
            branch_exists_local: local.unwrap_or(false),
            branch_exists_remote: remote.unwrap_or(false),
        };
        anomalies.extend(detect(&input, now));
    }
    anomalies
}
