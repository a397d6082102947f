//! Notification channel to the rig's witness.
//!
//! The refinery reports failed merges by mail. The transport is a capability
//! ([`Notifier`]); [`FileMailbox`] is the local implementation that appends
//! one JSON line per message to the recipient's mailbox file.

pub mod file;
pub mod protocol;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::PersistError;

pub use file::FileMailbox;
pub use protocol::{MergeFailed, parse_merge_failed};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail delivery failed: {0}")]
    Persist(#[from] PersistError),

    #[error("mail delivery failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid recipient {0:?}")]
    InvalidRecipient(String),

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },

    /// Transport-specific failure.
    #[error("mail transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, MailError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A single mail message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender address, e.g. `gastown/refinery`.
    pub from: String,
    /// Recipient address, e.g. `gastown/witness`.
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    pub sent_at: DateTime<Utc>,
}

/// Delivers messages to agents.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &Message) -> Result<()>;
}

/// Address of a rig's witness.
pub fn witness_address(rig: &str) -> String {
    format!("{rig}/witness")
}

/// Address of a rig's refinery.
pub fn refinery_address(rig: &str) -> String {
    format!("{rig}/refinery")
}
