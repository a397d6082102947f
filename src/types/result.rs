//! Per-attempt merge results and failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::Sha;

/// The outcome of one pass through the merge pipeline.
///
/// Ephemeral: it drives the outcome handler and is never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub success: bool,

    /// The squash commit that landed on the target branch.
    pub merge_commit: Option<Sha>,

    /// Human-readable failure description.
    pub error: Option<String>,

    /// The branch conflicts with the target.
    pub conflict: bool,

    /// The configured test command failed after all retries.
    pub tests_failed: bool,

    /// Merge slot contention outlasted the retry budget.
    pub slot_timeout: bool,
}

impl ProcessResult {
    pub fn merged(merge_commit: Sha) -> Self {
        ProcessResult {
            success: true,
            merge_commit: Some(merge_commit),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ProcessResult {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn conflict(error: impl Into<String>) -> Self {
        ProcessResult {
            conflict: true,
            ..Self::failed(error)
        }
    }

    pub fn tests_failed(error: impl Into<String>) -> Self {
        ProcessResult {
            tests_failed: true,
            ..Self::failed(error)
        }
    }

    pub fn slot_timeout(error: impl Into<String>) -> Self {
        ProcessResult {
            slot_timeout: true,
            ..Self::failed(error)
        }
    }

    /// Returns the error text, or an empty string for successes.
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// Classifies a failed result. Returns `None` for successes.
    ///
    /// Precedence is conflict, then tests, then build. Build is the class
    /// with no flag of its own, so a set `slot_timeout` flag is checked before
    /// falling back to it: a slot timeout is never reported as a build
    /// failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.success {
            return None;
        }
        Some(if self.conflict {
            FailureKind::Conflict
        } else if self.tests_failed {
            FailureKind::Tests
        } else if self.slot_timeout {
            FailureKind::SlotTimeout
        } else {
            FailureKind::Build
        })
    }
}

/// Failure classes, as reported to the witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Conflict,
    Tests,
    Build,
    /// Transient slot contention. Never notified.
    SlotTimeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Conflict => "conflict",
            FailureKind::Tests => "tests",
            FailureKind::Build => "build",
            FailureKind::SlotTimeout => "slot-timeout",
        }
    }

    /// Whether a failure of this kind should page the witness.
    pub fn notifies(&self) -> bool {
        !matches!(self, FailureKind::SlotTimeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
