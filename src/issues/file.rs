//! File-backed issue and merge-slot store.
//!
//! Keeps a whole rig's records in one JSON document, rewritten atomically
//! after every mutation. Every call goes back to disk under an advisory lock
//! on a `<path>.lock` sidecar, so agents filing MRs and the refinery worker
//! can share one document. This is enough to run the refinery against a plain
//! directory and is what the scenario tests use; larger deployments plug a
//! real tracker in behind [`IssueStore`] and [`SlotStore`].

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{Issue, IssueError, IssueQuery, IssueStatus, IssueStore, IssueUpdate, NewIssue};
use crate::persistence::{PersistError, read_json, write_json_atomic};
use crate::slot::{SlotError, SlotStatus, SlotStore};
use crate::types::IssueId;

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDoc {
    next_id: u64,
    #[serde(default)]
    issues: BTreeMap<IssueId, Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merge_slot: Option<SlotRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotRecord {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    holder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    waiters: Vec<String>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A JSON-file issue store that also hosts the rig's merge slot.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    prefix: String,
}

impl FileStore {
    /// Opens (or lazily creates) the store at `path`.
    ///
    /// New record IDs are `<prefix>-<n>`. An existing document is parsed once
    /// here so a corrupt file fails at startup rather than on first use.
    pub fn open(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, PersistError> {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        let store = FileStore {
            path,
            lock_path,
            prefix: prefix.into(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces a record verbatim.
    ///
    /// Used to seed stores from fixtures and by tooling that imports records.
    pub fn put(&self, issue: Issue) -> Result<(), PersistError> {
        self.mutate(|doc| {
            doc.issues.insert(issue.id.clone(), issue);
            Ok::<_, PersistError>(())
        })
    }

    /// Opens the sidecar lock file and locks it. The lock is dropped with the
    /// returned handle.
    fn lock_file(&self, exclusive: bool) -> Result<File, PersistError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(file)
    }

    /// Reads the current document under a shared lock.
    fn load(&self) -> Result<StoreDoc, PersistError> {
        let _lock = self.lock_file(false)?;
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Re-reads the document under an exclusive lock, applies `f` and
    /// persists the result.
    ///
    /// Nothing is written when `f` fails.
    fn mutate<T, E>(&self, f: impl FnOnce(&mut StoreDoc) -> Result<T, E>) -> Result<T, E>
    where
        E: From<PersistError>,
    {
        let _lock = self.lock_file(true)?;
        let mut doc: StoreDoc = read_json(&self.path)?.unwrap_or_default();
        let out = f(&mut doc)?;
        write_json_atomic(&self.path, &doc)?;
        Ok(out)
    }

    fn slot_id(&self) -> String {
        format!("{}-merge-slot", self.prefix)
    }
}

fn issue_mut<'a>(doc: &'a mut StoreDoc, id: &IssueId) -> Result<&'a mut Issue, IssueError> {
    doc.issues
        .get_mut(id)
        .ok_or_else(|| IssueError::NotFound(id.clone()))
}

impl IssueStore for FileStore {
    fn list(&self, query: &IssueQuery) -> super::Result<Vec<Issue>> {
        Ok(self
            .load()?
            .issues
            .into_values()
            .filter(|issue| query.matches(issue))
            .collect())
    }

    fn show(&self, id: &IssueId) -> super::Result<Issue> {
        self.load()?
            .issues
            .remove(id)
            .ok_or_else(|| IssueError::NotFound(id.clone()))
    }

    fn update(&self, id: &IssueId, update: &IssueUpdate) -> super::Result<()> {
        self.mutate(|doc| {
            let issue = issue_mut(doc, id)?;
            if let Some(assignee) = &update.assignee {
                issue.assignee = assignee.clone().filter(|a| !a.is_empty());
            }
            if let Some(description) = &update.description {
                issue.description = description.clone();
            }
            for label in &update.add_labels {
                if !issue.has_label(label) {
                    issue.labels.push(label.clone());
                }
            }
            issue.labels.retain(|l| !update.remove_labels.contains(l));
            if let Some(active_mr) = &update.active_mr {
                issue.active_mr = active_mr.clone();
            }
            issue.updated_at = Some(now_rfc3339());
            Ok(())
        })
    }

    fn close(&self, id: &IssueId, reason: &str) -> super::Result<()> {
        self.mutate(|doc| {
            let issue = issue_mut(doc, id)?;
            issue.status = IssueStatus::Closed;
            issue.close_reason = Some(reason.to_string());
            issue.updated_at = Some(now_rfc3339());
            Ok(())
        })
    }

    fn add_dependency(&self, issue: &IssueId, depends_on: &IssueId) -> super::Result<()> {
        self.mutate(|doc| {
            if !doc.issues.contains_key(depends_on) {
                return Err(IssueError::NotFound(depends_on.clone()));
            }
            let record = issue_mut(doc, issue)?;
            if !record.blocked_by.contains(depends_on) {
                record.blocked_by.push(depends_on.clone());
                record.updated_at = Some(now_rfc3339());
            }
            Ok(())
        })
    }

    fn create(&self, new: &NewIssue) -> super::Result<Issue> {
        self.mutate(|doc| {
            doc.next_id += 1;
            let now = now_rfc3339();
            let issue = Issue {
                id: IssueId(format!("{}-{}", self.prefix, doc.next_id)),
                title: new.title.clone(),
                description: new.description.clone(),
                status: IssueStatus::Open,
                issue_type: new.issue_type.clone(),
                priority: new.priority,
                labels: Vec::new(),
                assignee: None,
                created_at: Some(now.clone()),
                updated_at: Some(now),
                blocked_by: Vec::new(),
                close_reason: None,
                created_by: Some(new.actor.clone()),
                active_mr: None,
            };
            doc.issues.insert(issue.id.clone(), issue.clone());
            Ok(issue)
        })
    }
}

impl SlotStore for FileStore {
    fn ensure_exists(&self) -> crate::slot::Result<String> {
        let id = self.slot_id();
        if self.load()?.merge_slot.is_some() {
            return Ok(id);
        }
        self.mutate(|doc| {
            doc.merge_slot.get_or_insert_with(|| SlotRecord {
                id: id.clone(),
                holder: None,
                waiters: Vec::new(),
            });
            Ok::<_, SlotError>(())
        })?;
        Ok(id)
    }

    fn acquire(&self, holder: &str, add_waiter: bool) -> crate::slot::Result<Option<SlotStatus>> {
        self.mutate(|doc| {
            let slot = doc
                .merge_slot
                .as_mut()
                .ok_or_else(|| SlotError::Store("merge slot does not exist".to_string()))?;
            match slot.holder.as_deref() {
                None => {
                    slot.holder = Some(holder.to_string());
                    slot.waiters.retain(|w| w != holder);
                }
                Some(current) if current == holder => {}
                Some(_) => {
                    if add_waiter && !slot.waiters.iter().any(|w| w == holder) {
                        slot.waiters.push(holder.to_string());
                    }
                }
            }
            Ok(Some(SlotStatus {
                id: slot.id.clone(),
                available: false,
                holder: slot.holder.clone(),
                waiters: slot.waiters.clone(),
            }))
        })
    }

    fn release(&self, holder: &str) -> crate::slot::Result<()> {
        self.mutate(|doc| {
            let slot = doc
                .merge_slot
                .as_mut()
                .ok_or_else(|| SlotError::Store("merge slot does not exist".to_string()))?;
            if slot.holder.as_deref() != Some(holder) {
                return Err(SlotError::NotHeld {
                    holder: holder.to_string(),
                    current: slot.holder.clone(),
                });
            }
            slot.holder = None;
            Ok(())
        })
    }
}
