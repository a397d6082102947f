//! HTTP server for queue inspection.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns 200 if server is running
//! - `GET /api/v1/queue` - Ready MRs in processing order, with scores
//! - `GET /api/v1/blocked` - MRs waiting on an open blocker
//! - `GET /api/v1/mrs` - Every open MR with branch existence
//! - `GET /api/v1/anomalies` - Stale claims and orphaned branches

use std::sync::Arc;

use crate::git::Vcs;
use crate::queue::MergeQueue;

pub mod health;
pub mod state;

pub use health::health_handler;
pub use state::{StateError, anomalies_handler, blocked_handler, open_handler, queue_handler};

/// Shared application state.
///
/// Handlers reach the queue through it, and the branch lookups behind
/// `/api/v1/mrs` and `/api/v1/anomalies` go through `vcs`.
pub struct AppState<V> {
    inner: Arc<AppStateInner<V>>,
}

struct AppStateInner<V> {
    queue: Arc<MergeQueue>,
    vcs: V,
}

// Manual impl: `V` itself need not be `Clone`.
impl<V> Clone for AppState<V> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Vcs> AppState<V> {
    pub fn new(queue: Arc<MergeQueue>, vcs: V) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { queue, vcs }),
        }
    }

    pub fn queue(&self) -> &MergeQueue {
        &self.inner.queue
    }

    pub fn vcs(&self) -> &V {
        &self.inner.vcs
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<V: Vcs + 'static>(app_state: AppState<V>) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/api/v1/queue", get(queue_handler::<V>))
        .route("/api/v1/blocked", get(blocked_handler::<V>))
        .route("/api/v1/mrs", get(open_handler::<V>))
        .route("/api/v1/anomalies", get(anomalies_handler::<V>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
