//! Slot acquisition with backoff, holder tokens and the self-conflict bypass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Result, SlotBackoff, SlotError, SlotStore, conflict_holder};

/// Outcome of acquiring the slot for a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSlot {
    /// We hold the slot under this token and must release it.
    Acquired(String),
    /// Our own conflict-resolution path holds the slot; nothing to release.
    Bypassed,
}

impl PushSlot {
    pub fn holder(&self) -> Option<&str> {
        match self {
            PushSlot::Acquired(holder) => Some(holder),
            PushSlot::Bypassed => None,
        }
    }
}

/// Outcome of the single, non-retrying acquire done before escalating a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictSlot {
    /// We hold the slot as `<rig>/refinery`.
    Acquired(String),
    /// Someone else holds it; the escalation should be deferred.
    HeldBy(String),
    /// The slot could not be consulted. Escalation proceeds without it.
    Unavailable,
}

/// Merge slot client for one rig.
///
/// Owns the holder sequence counter, so tokens minted by one client are
/// unique even when the clock returns identical timestamps.
pub struct SlotClient {
    store: Arc<dyn SlotStore>,
    rig: String,
    backoff: SlotBackoff,
    seq: AtomicU64,
}

impl std::fmt::Debug for SlotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotClient")
            .field("rig", &self.rig)
            .field("backoff", &self.backoff)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl SlotClient {
    pub fn new(store: Arc<dyn SlotStore>, rig: impl Into<String>, backoff: SlotBackoff) -> Self {
        SlotClient {
            store,
            rig: rig.into(),
            backoff,
            seq: AtomicU64::new(0),
        }
    }

    pub fn rig(&self) -> &str {
        &self.rig
    }

    pub fn backoff(&self) -> &SlotBackoff {
        &self.backoff
    }

    /// The conflict-resolution holder identity for this rig.
    pub fn conflict_holder(&self) -> String {
        conflict_holder(&self.rig)
    }

    /// Mints a fresh push holder token.
    pub fn next_push_holder(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}/refinery/push/{nanos}-{seq}", self.rig)
    }

    /// Acquires the slot for a push to the default branch.
    ///
    /// Retries with exponential backoff while the slot is busy. Store errors
    /// and empty statuses are returned immediately. Exhausting the retry
    /// budget yields [`SlotError::ContentionTimeout`]; cancellation during a
    /// wait yields [`SlotError::Cancelled`].
    pub async fn acquire_push_slot(&self, cancel: &CancellationToken) -> Result<PushSlot> {
        let slot = self.store.ensure_exists()?;
        let holder = self.next_push_holder();
        let self_conflict = self.conflict_holder();

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay_for_retry(attempt - 1);
                debug!(
                    slot = %slot,
                    attempt,
                    max_retries = self.backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "merge slot held, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SlotError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if cancel.is_cancelled() {
                return Err(SlotError::Cancelled);
            }

            let status = self
                .store
                .acquire(&holder, false)?
                .ok_or_else(|| SlotError::EmptyStatus {
                    slot: slot.clone(),
                    holder: holder.clone(),
                })?;

            if status.available || status.held_by(&holder) {
                debug!(slot = %slot, holder = %holder, "acquired merge slot for push");
                return Ok(PushSlot::Acquired(holder));
            }
            if status.held_by(&self_conflict) {
                info!(slot = %slot, "merge slot held by conflict-resolution path, proceeding");
                return Ok(PushSlot::Bypassed);
            }
        }

        Err(SlotError::ContentionTimeout {
            slot,
            retries: self.backoff.max_retries,
        })
    }

    /// Makes one attempt to take the slot as `<rig>/refinery`.
    ///
    /// Store failures are logged and reported as [`ConflictSlot::Unavailable`]:
    /// conflict escalation does not depend on the slot being reachable.
    pub fn try_acquire_conflict_slot(&self) -> ConflictSlot {
        let slot = match self.store.ensure_exists() {
            Ok(slot) => slot,
            Err(e) => {
                warn!(error = %e, "could not ensure merge slot");
                return ConflictSlot::Unavailable;
            }
        };
        let holder = self.conflict_holder();
        match self.store.acquire(&holder, false) {
            Err(e) => {
                warn!(slot = %slot, error = %e, "could not acquire merge slot");
                ConflictSlot::Unavailable
            }
            Ok(None) => {
                warn!(slot = %slot, "merge slot returned no status");
                ConflictSlot::Unavailable
            }
            Ok(Some(status)) => match status.holder {
                Some(current) if !status.available && !current.is_empty() && current != holder => {
                    ConflictSlot::HeldBy(current)
                }
                _ => {
                    info!(slot = %slot, holder = %holder, "acquired merge slot for conflict resolution");
                    ConflictSlot::Acquired(holder)
                }
            },
        }
    }

    pub fn release(&self, holder: &str) -> Result<()> {
        self.store.release(holder)
    }

    /// Releases `holder`, logging instead of failing.
    pub fn release_best_effort(&self, holder: &str) {
        match self.store.release(holder) {
            Ok(()) => debug!(holder = %holder, "released merge slot"),
            Err(e) => debug!(holder = %holder, error = %e, "merge slot release skipped"),
        }
    }
}
