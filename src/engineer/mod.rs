//! The merge engineer: runs the per-MR pipeline and acts on its outcome.
//!
//! One engineer serves one rig. It is generic over version control and the
//! test runner so scenario tests can drive it with scripted doubles; issue,
//! slot, mail and convoy backends are shared trait objects.
//!
//! The engineer keeps no state between attempts. Claims, slot holders and
//! blocking edges all live in the stores, so any attempt can be re-run from
//! the top after a crash.

mod outcome;
mod process;


use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{MergeQueueConfig, RigConfig};
use crate::convoy::{ConvoyObserver, StoreConvoyObserver};
use crate::git::Vcs;
use crate::issues::IssueStore;
use crate::mail::Notifier;
use crate::runner::CommandRunner;
use crate::slot::{SlotClient, SlotStore};

pub use outcome::{conflict_task_description, conflict_task_title};

/// Name of the remote the refinery pulls from and pushes to.
pub const REMOTE: &str = "origin";

pub struct Engineer<V, R> {
    rig: String,
    default_branch: String,
    workdir: PathBuf,
    config: MergeQueueConfig,
    vcs: V,
    runner: R,
    issues: Arc<dyn IssueStore>,
    slots: SlotClient,
    notifier: Arc<dyn Notifier>,
    convoys: Arc<dyn ConvoyObserver>,
}

impl<V: Vcs, R: CommandRunner> Engineer<V, R> {
    /// Builds an engineer for `rig`, working in `workdir`.
    ///
    /// Convoy continuation defaults to checking convoys in `issues`.
    pub fn new(
        rig: &RigConfig,
        workdir: impl Into<PathBuf>,
        vcs: V,
        runner: R,
        issues: Arc<dyn IssueStore>,
        slot_store: Arc<dyn SlotStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let slots = SlotClient::new(slot_store, rig.name.clone(), rig.merge_queue.slot_backoff());
        Engineer {
            rig: rig.name.clone(),
            default_branch: rig.default_branch.clone(),
            workdir: workdir.into(),
            config: rig.merge_queue.clone(),
            vcs,
            runner,
            convoys: Arc::new(StoreConvoyObserver::new(issues.clone())),
            issues,
            slots,
            notifier,
        }
    }

    pub fn with_convoy_observer(mut self, convoys: Arc<dyn ConvoyObserver>) -> Self {
        self.convoys = convoys;
        self
    }

    pub fn rig(&self) -> &str {
        &self.rig
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn config(&self) -> &MergeQueueConfig {
        &self.config
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn issues(&self) -> &Arc<dyn IssueStore> {
        &self.issues
    }

    pub fn slots(&self) -> &SlotClient {
        &self.slots
    }

    /// The identity the refinery claims MRs and creates tasks under.
    pub fn actor(&self) -> String {
        self.slots.conflict_holder()
    }
}
