//! Core domain types for the merge queue.
//!
//! Leaf types shared by every other module: identifiers, queued merge
//! requests, per-attempt results and queue anomalies.

pub mod anomaly;
pub mod ids;
pub mod mr;
pub mod result;

pub use anomaly::{AnomalyKind, MrAnomaly, Severity};
pub use ids::{InvalidSha, IssueId, Sha};
pub use mr::{MergeRequest, OpenMr};
pub use result::{FailureKind, ProcessResult};
