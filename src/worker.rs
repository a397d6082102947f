//! The queue worker: one processing actor per rig.
//!
//! Each cycle drains the ready queue in score order. The top MR is claimed
//! as `<rig>/refinery`, processed, and its outcome handled; the worker then
//! moves on to the next MR straight away. An MR is attempted at most once
//! per cycle, so one that keeps failing waits for the next poll instead of
//! spinning the loop. When nothing is left the worker sleeps for
//! `poll_interval`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engineer::Engineer;
use crate::git::Vcs;
use crate::issues::IssueError;
use crate::queue::MergeQueue;
use crate::runner::CommandRunner;
use crate::types::{IssueId, MergeRequest};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to list ready merge requests: {0}")]
    Queue(#[from] IssueError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Totals for one drain of the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub merged: usize,
    pub failed: usize,
    /// MRs another worker claimed between listing and claiming.
    pub skipped: usize,
}

impl CycleSummary {
    pub fn attempted(&self) -> usize {
        self.merged + self.failed
    }
}

pub struct Worker<V, R> {
    engineer: Engineer<V, R>,
    queue: Arc<MergeQueue>,
    enabled: bool,
    poll_interval: Duration,
}

impl<V: Vcs, R: CommandRunner> Worker<V, R> {
    pub fn new(engineer: Engineer<V, R>, queue: Arc<MergeQueue>) -> Self {
        let config = engineer.config();
        let (enabled, poll_interval) = (config.enabled, config.poll_interval);
        if config.max_concurrent > 1 {
            warn!(
                max_concurrent = config.max_concurrent,
                "merges are serialized per rig, processing one at a time"
            );
        }
        Worker {
            engineer,
            queue,
            enabled,
            poll_interval,
        }
    }

    pub fn engineer(&self) -> &Engineer<V, R> {
        &self.engineer
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            rig = %self.engineer.rig(),
            enabled = self.enabled,
            poll_interval = ?self.poll_interval,
            "refinery worker started"
        );

        loop {
            if self.enabled {
                match self.drain(&shutdown).await {
                    Ok(summary) if summary.attempted() > 0 => info!(
                        merged = summary.merged,
                        failed = summary.failed,
                        "queue drained"
                    ),
                    Ok(_) => debug!("queue empty"),
                    Err(e) => error!(error = %e, "queue cycle failed"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping worker");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Processes ready MRs until the queue is empty or every ready MR has
    /// been attempted this cycle.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        let mut attempted: HashSet<IssueId> = HashSet::new();

        while !cancel.is_cancelled() {
            let ready = self.queue.list_ready(Utc::now())?;
            let Some(mr) = ready.into_iter().find(|mr| !attempted.contains(&mr.id)) else {
                break;
            };
            attempted.insert(mr.id.clone());

            if let Err(e) = self.queue.claim(&mr.id, &self.engineer.actor()) {
                warn!(mr = %mr.id, error = %e, "failed to claim merge request, skipping");
                summary.skipped += 1;
                continue;
            }

            if self.attempt(&mr, cancel).await {
                summary.merged += 1;
            } else {
                summary.failed += 1;
            }
        }

        Ok(summary)
    }

    async fn attempt(&self, mr: &MergeRequest, cancel: &CancellationToken) -> bool {
        let result = self.engineer.process(mr, cancel).await;
        self.engineer.handle_result(mr, &result).await;

        if !result.success
            && let Err(e) = self.queue.release(&mr.id)
        {
            warn!(mr = %mr.id, error = %e, "failed to release claim");
        }
        result.success
    }
}
