//! Queue inspection endpoints.
//!
//! Read-only views over the issue store, computed on every request.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;

use super::AppState;
use crate::anomaly::{ScanRecord, detect_queue_anomalies};
use crate::git::Vcs;
use crate::issues::{IssueError, IssueQuery};
use crate::queue::ScoredMr;
use crate::types::{MergeRequest, MrAnomaly, OpenMr};

/// Errors that can occur when inspecting the queue.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("issue store error: {0}")]
    Store(#[from] IssueError),
}

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        let status = match &self {
            StateError::Store(IssueError::NotFound(_)) => StatusCode::NOT_FOUND,
            StateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Ready MRs, best first, with their scores.
///
/// ```ignore
/// GET /api/v1/queue HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// [{"id": "gt-mr1", "branch": "polecat/nux/gt-abc", ..., "score": 1012.5}]
/// ```
pub async fn queue_handler<V: Vcs + 'static>(
    State(app_state): State<AppState<V>>,
) -> Result<Json<Vec<ScoredMr>>, StateError> {
    Ok(Json(app_state.queue().list_ready_scored(Utc::now())?))
}

/// Open MRs waiting on an open blocker, with `blocked_by` set.
pub async fn blocked_handler<V: Vcs + 'static>(
    State(app_state): State<AppState<V>>,
) -> Result<Json<Vec<MergeRequest>>, StateError> {
    Ok(Json(app_state.queue().list_blocked()?))
}

/// Every open MR with local and remote branch existence.
pub async fn open_handler<V: Vcs + 'static>(
    State(app_state): State<AppState<V>>,
) -> Result<Json<Vec<OpenMr>>, StateError> {
    Ok(Json(app_state.queue().list_all_open(app_state.vcs()).await?))
}

/// Stale claims and orphaned branches across open MRs.
pub async fn anomalies_handler<V: Vcs + 'static>(
    State(app_state): State<AppState<V>>,
) -> Result<Json<Vec<MrAnomaly>>, StateError> {
    let records: Vec<ScanRecord> = app_state
        .queue()
        .store()
        .list(&IssueQuery::open_merge_requests())?
        .iter()
        .map(ScanRecord::from_issue)
        .collect();
    let anomalies = detect_queue_anomalies(&records, Utc::now(), app_state.vcs()).await;
    Ok(Json(anomalies))
}
