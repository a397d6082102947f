//! The merge slot: per-rig mutual exclusion for pushes to the protected branch.
//!
//! One slot exists per rig. It is created lazily ([`SlotStore::ensure_exists`]),
//! never destroyed, and held only while a push to the default branch is in
//! flight or while a conflict resolution is outstanding.
//!
//! Holders are either a unique per-attempt push token
//! (`<rig>/refinery/push/<nanos>-<seq>`) or the fixed conflict-resolution
//! identity `<rig>/refinery`. Because the refinery is a single actor per rig,
//! a push that finds the slot held by its own conflict-resolution identity
//! proceeds without acquiring (the self-conflict bypass).

pub mod backoff;
pub mod client;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::PersistError;

pub use backoff::SlotBackoff;
pub use client::{ConflictSlot, PushSlot, SlotClient};

/// Errors from merge slot operations.
#[derive(Debug, Error)]
pub enum SlotError {
    /// The slot stayed busy for the whole retry budget.
    ///
    /// This is the only variant that represents genuine contention; an MR
    /// that fails with it stays queued without notifying anyone.
    #[error("merge slot {slot}: merge slot contention timeout after {retries} retries")]
    ContentionTimeout { slot: String, retries: u32 },

    /// The caller's context was cancelled while waiting.
    #[error("merge slot wait cancelled")]
    Cancelled,

    /// The backing store answered without a status.
    #[error("acquire merge slot {slot} ({holder}): empty status")]
    EmptyStatus { slot: String, holder: String },

    /// Release was attempted by someone who does not hold the slot.
    #[error("merge slot not held by {holder} (held by {current:?})")]
    NotHeld {
        holder: String,
        current: Option<String>,
    },

    /// Backing store failure.
    #[error("merge slot store: {0}")]
    Store(String),

    #[error("merge slot store: {0}")]
    Persist(#[from] PersistError),
}

impl SlotError {
    pub fn is_contention_timeout(&self) -> bool {
        matches!(self, SlotError::ContentionTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, SlotError>;

/// Slot state as reported by the backing store after an acquire attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub id: String,
    /// True if the slot was free.
    pub available: bool,
    /// Current holder, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiters: Vec<String>,
}

impl SlotStatus {
    /// Returns true if `holder` owns the slot according to this status.
    pub fn held_by(&self, holder: &str) -> bool {
        self.holder.as_deref() == Some(holder)
    }
}

/// Backing store for the rig's merge slot.
///
/// `acquire` must be idempotent per holder: acquiring a slot you already
/// hold succeeds and leaves it held.
pub trait SlotStore: Send + Sync {
    /// Creates the slot if it does not exist; returns its ID.
    fn ensure_exists(&self) -> Result<String>;

    /// Attempts to take the slot for `holder`.
    ///
    /// Returns `Ok(None)` if the store produced no status, which callers
    /// treat as an infrastructure error.
    fn acquire(&self, holder: &str, add_waiter: bool) -> Result<Option<SlotStatus>>;

    fn release(&self, holder: &str) -> Result<()>;
}

/// The fixed holder identity used by the conflict-resolution path.
pub fn conflict_holder(rig: &str) -> String {
    format!("{rig}/refinery")
}
