//! Rig Refinery - the merge queue for a rig shared by coding agents.
//!
//! Workers submit merge requests as records in the rig's issue store. The
//! refinery picks them up in score order, squash-merges each branch onto
//! its target under the rig's merge slot, and either closes the records or
//! notifies the witness and files a conflict-resolution task.

pub mod anomaly;
pub mod config;
pub mod convoy;
pub mod engineer;
pub mod git;
pub mod issues;
pub mod mail;
pub mod persistence;
pub mod queue;
pub mod runner;
pub mod scoring;
pub mod server;
pub mod slot;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
