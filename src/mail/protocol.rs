//! The MERGE_FAILED protocol message.
//!
//! Subject is `MERGE_FAILED <worker>`; the body is a block of
//! `Key: value` lines:
//!
//! ```text
//! Branch: polecat/nux/gt-abc
//! Issue: gt-abc
//! Polecat: nux
//! Rig: gastown
//! Target: main
//! Failure-Type: tests
//! Error: tests failed after 2 attempts
//! ```

use chrono::Utc;

use super::{MailError, Message, Priority, Result, refinery_address, witness_address};
use crate::types::FailureKind;

pub const MERGE_FAILED: &str = "MERGE_FAILED";

/// Payload of a MERGE_FAILED notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFailed {
    pub rig: String,
    pub worker: String,
    pub branch: String,
    pub issue: String,
    pub target: String,
    pub failure: FailureKind,
    pub error: String,
}

impl MergeFailed {
    /// Builds the refinery → witness message.
    pub fn to_message(&self) -> Message {
        let body = format!(
            "Branch: {}\nIssue: {}\nPolecat: {}\nRig: {}\nTarget: {}\nFailure-Type: {}\nError: {}",
            self.branch,
            self.issue,
            self.worker,
            self.rig,
            self.target,
            self.failure,
            // Multi-line errors would break the line protocol.
            self.error.replace('\n', " "),
        );
        Message {
            from: refinery_address(&self.rig),
            to: witness_address(&self.rig),
            subject: format!("{MERGE_FAILED} {}", self.worker),
            body,
            priority: Priority::High,
            sent_at: Utc::now(),
        }
    }
}

/// Returns true if `subject` is a MERGE_FAILED subject.
pub fn is_merge_failed(subject: &str) -> bool {
    let subject = subject.trim();
    subject == MERGE_FAILED
        || subject
            .strip_prefix(MERGE_FAILED)
            .is_some_and(|rest| rest.starts_with(' '))
}

/// Worker name from a protocol subject (`MERGE_FAILED nux` → `nux`).
pub fn extract_worker(subject: &str) -> Option<&str> {
    let (_, worker) = subject.trim().split_once(' ')?;
    let worker = worker.trim();
    (!worker.is_empty()).then_some(worker)
}

fn malformed(reason: impl Into<String>) -> MailError {
    MailError::Malformed {
        kind: MERGE_FAILED,
        reason: reason.into(),
    }
}

/// Parses a MERGE_FAILED message body.
///
/// Unknown keys are ignored. An empty body, a missing `Branch:` line or an
/// unknown failure type is an error.
pub fn parse_merge_failed(body: &str) -> Result<MergeFailed> {
    if body.trim().is_empty() {
        return Err(malformed("empty body"));
    }

    let mut out = MergeFailed {
        rig: String::new(),
        worker: String::new(),
        branch: String::new(),
        issue: String::new(),
        target: String::new(),
        failure: FailureKind::Build,
        error: String::new(),
    };
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "Branch" => out.branch = value,
            "Issue" => out.issue = value,
            "Polecat" => out.worker = value,
            "Rig" => out.rig = value,
            "Target" => out.target = value,
            "Failure-Type" => {
                out.failure = match value.as_str() {
                    "conflict" => FailureKind::Conflict,
                    "tests" => FailureKind::Tests,
                    "build" => FailureKind::Build,
                    other => return Err(malformed(format!("unknown failure type {other:?}"))),
                }
            }
            "Error" => out.error = value,
            _ => {}
        }
    }

    if out.branch.is_empty() {
        return Err(malformed("missing Branch"));
    }
    Ok(out)
}
