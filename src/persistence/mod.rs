//! Durable on-disk state for the file-backed stores.
//!
//! Everything the refinery persists locally (issue records, the merge slot,
//! mailbox entries) goes through this module. Whole-document state is written
//! with write-to-temp-then-rename so a crash leaves either the old or the new
//! document, never a torn one.

pub mod atomic;
pub mod fsync;

pub use atomic::{PersistError, read_json, write_json_atomic};
pub use fsync::{fsync_dir, fsync_file};
