//! Convoy continuation after a merge.
//!
//! A convoy is a record of type `convoy` that tracks a batch of issues
//! through its dependency edges. When a merge closes one of those issues the
//! refinery asks the observer to re-check the convoys tracking it, closing
//! any whose tracked issues are now all closed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::issues::{self, IssueQuery, IssueStatus, IssueStore};
use crate::types::IssueId;

pub const CONVOY_TYPE: &str = "convoy";

/// Close reason recorded on convoys completed by the observer.
pub const CONVOY_COMPLETE_REASON: &str = "All tracked issues closed";

/// Hook invoked after a source issue is closed by a merge.
pub trait ConvoyObserver: Send + Sync {
    /// Re-checks convoys tracking `issue`. Returns the convoys inspected.
    fn issue_closed(&self, issue: &IssueId) -> Vec<IssueId>;
}

/// Observer that does nothing, for rigs that do not use convoys.
#[derive(Debug, Default)]
pub struct NoConvoys;

impl ConvoyObserver for NoConvoys {
    fn issue_closed(&self, _issue: &IssueId) -> Vec<IssueId> {
        Vec::new()
    }
}

/// Observer backed by the issue store.
pub struct StoreConvoyObserver {
    store: Arc<dyn IssueStore>,
}

impl StoreConvoyObserver {
    pub fn new(store: Arc<dyn IssueStore>) -> Self {
        StoreConvoyObserver { store }
    }
}

impl ConvoyObserver for StoreConvoyObserver {
    fn issue_closed(&self, issue: &IssueId) -> Vec<IssueId> {
        let query = IssueQuery {
            issue_type: Some(CONVOY_TYPE.to_string()),
            status: Some(IssueStatus::Open),
            label: None,
        };
        let convoys = match self.store.list(&query) {
            Ok(convoys) => convoys,
            Err(e) => {
                warn!(issue = %issue, error = %e, "could not list convoys");
                return Vec::new();
            }
        };

        let mut checked = Vec::new();
        for convoy in convoys.iter().filter(|c| c.blocked_by.contains(issue)) {
            checked.push(convoy.id.clone());
            let pending = convoy
                .blocked_by
                .iter()
                .filter(|tracked| issues::is_open(self.store.as_ref(), tracked))
                .count();
            if pending > 0 {
                debug!(convoy = %convoy.id, pending, "convoy still has open issues");
                continue;
            }
            match self.store.close(&convoy.id, CONVOY_COMPLETE_REASON) {
                Ok(()) => info!(convoy = %convoy.id, "closed completed convoy"),
                Err(e) => warn!(convoy = %convoy.id, error = %e, "failed to close convoy"),
            }
        }
        checked
    }
}
