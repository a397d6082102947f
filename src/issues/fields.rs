//! MR fields embedded in issue descriptions.
//!
//! A merge request is an ordinary issue whose description carries
//! `key: value` lines:
//!
//! ```text
//! branch: polecat/nux/gt-abc
//! target: main
//! source_issue: gt-abc
//! worker: nux
//! rig: gastown
//!
//! Free-form notes survive untouched.
//! ```
//!
//! Keys are matched case-insensitively and `-` is accepted in place of `_`
//! (`source-issue`). Lines that are not recognized fields are prose and are
//! preserved in order when the fields are rewritten.

use chrono::{DateTime, Utc};

use crate::types::{IssueId, Sha};

const BRANCH: &str = "branch";
const TARGET: &str = "target";
const SOURCE_ISSUE: &str = "source_issue";
const WORKER: &str = "worker";
const RIG: &str = "rig";
const MERGE_COMMIT: &str = "merge_commit";
const CLOSE_REASON: &str = "close_reason";
const AGENT_BEAD: &str = "agent_bead";
const RETRY_COUNT: &str = "retry_count";
const CONVOY_ID: &str = "convoy_id";
const CONVOY_CREATED_AT: &str = "convoy_created_at";

/// Structured MR data parsed from a description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MrFields {
    pub branch: String,
    pub target: String,
    pub source_issue: Option<IssueId>,
    pub worker: String,
    pub rig: String,
    pub merge_commit: Option<Sha>,
    pub close_reason: Option<String>,
    pub agent_bead: Option<IssueId>,
    pub retry_count: u32,
    pub convoy_id: Option<IssueId>,
    /// Raw RFC 3339 text; see [`MrFields::convoy_created_at`].
    pub convoy_created_at: Option<String>,
}

impl MrFields {
    /// Parses the convoy creation time, ignoring unparsable values.
    pub fn convoy_created_at(&self) -> Option<DateTime<Utc>> {
        self.convoy_created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    fn set(&mut self, key: &str, value: &str) {
        let value = value.to_string();
        let non_empty = |v: String| (!v.is_empty()).then_some(v);
        match key {
            BRANCH => self.branch = value,
            TARGET => self.target = value,
            SOURCE_ISSUE => self.source_issue = non_empty(value).map(IssueId),
            WORKER => self.worker = value,
            RIG => self.rig = value,
            MERGE_COMMIT => self.merge_commit = non_empty(value).map(Sha),
            CLOSE_REASON => self.close_reason = non_empty(value),
            AGENT_BEAD => self.agent_bead = non_empty(value).map(IssueId),
            RETRY_COUNT => self.retry_count = value.parse().unwrap_or(0),
            CONVOY_ID => self.convoy_id = non_empty(value).map(IssueId),
            CONVOY_CREATED_AT => self.convoy_created_at = non_empty(value),
            _ => {}
        }
    }

    /// Field lines in canonical order. Empty fields are omitted.
    fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut push = |key: &str, value: &str| {
            if !value.is_empty() {
                out.push(format!("{key}: {value}"));
            }
        };
        push(BRANCH, &self.branch);
        push(TARGET, &self.target);
        push(SOURCE_ISSUE, opt(&self.source_issue.as_ref().map(IssueId::as_str)));
        push(WORKER, &self.worker);
        push(RIG, &self.rig);
        push(MERGE_COMMIT, opt(&self.merge_commit.as_ref().map(Sha::as_str)));
        push(CLOSE_REASON, opt(&self.close_reason.as_deref()));
        push(AGENT_BEAD, opt(&self.agent_bead.as_ref().map(IssueId::as_str)));
        if self.retry_count > 0 {
            push(RETRY_COUNT, &self.retry_count.to_string());
        }
        push(CONVOY_ID, opt(&self.convoy_id.as_ref().map(IssueId::as_str)));
        push(CONVOY_CREATED_AT, opt(&self.convoy_created_at.as_deref()));
        out
    }
}

fn opt<'a>(value: &Option<&'a str>) -> &'a str {
    value.unwrap_or("")
}

/// Splits a line into a recognized field key and its value.
fn field_line(line: &str) -> Option<(&'static str, &str)> {
    let (key, value) = line.trim().split_once(':')?;
    let key = key.trim().to_ascii_lowercase().replace('-', "_");
    let canonical = [
        BRANCH,
        TARGET,
        SOURCE_ISSUE,
        WORKER,
        RIG,
        MERGE_COMMIT,
        CLOSE_REASON,
        AGENT_BEAD,
        RETRY_COUNT,
        CONVOY_ID,
        CONVOY_CREATED_AT,
    ]
    .into_iter()
    .find(|k| *k == key)?;
    Some((canonical, value.trim()))
}

/// Parses MR fields from a description.
///
/// Returns `None` when no recognized field is present: such an issue is not
/// a merge request.
pub fn parse_mr_fields(description: &str) -> Option<MrFields> {
    let mut fields = MrFields::default();
    let mut any = false;
    for line in description.lines() {
        if let Some((key, value)) = field_line(line) {
            fields.set(key, value);
            any = true;
        }
    }
    any.then_some(fields)
}

/// Returns the description with every field line removed.
///
/// Leading and trailing blank lines are dropped; interior prose is kept
/// verbatim.
pub fn strip_mr_fields(description: &str) -> String {
    let prose: Vec<&str> = description
        .lines()
        .filter(|line| field_line(line).is_none())
        .collect();
    let start = prose.iter().position(|l| !l.trim().is_empty());
    let end = prose.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(s), Some(e)) => prose[s..=e].join("\n"),
        _ => String::new(),
    }
}

/// Rewrites `description` so its fields equal `fields`.
///
/// Field lines come first in canonical order, followed by a blank line and
/// the original prose.
pub fn set_mr_fields(description: &str, fields: &MrFields) -> String {
    let mut out = fields.lines().join("\n");
    let prose = strip_mr_fields(description);
    if !prose.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&prose);
    }
    out
}
