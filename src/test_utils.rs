//! Shared test doubles and fixtures.
//!
//! In-memory implementations of every capability trait, plus a throwaway
//! git setup (bare origin + working clone) for tests that need real git.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::git::{GitError, GitResult, SubmoduleChange, Vcs};
use crate::issues::{
    self, Issue, IssueError, IssueQuery, IssueStatus, IssueStore, IssueUpdate, MERGE_REQUEST_TYPE,
    NewIssue,
};
use crate::mail::{self, MailError, Message, Notifier};
use crate::runner::{CommandOutput, CommandRunner, RunError};
use crate::slot::{self, SlotError, SlotStatus, SlotStore};
use crate::types::{IssueId, MergeRequest, Sha};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An open record with priority 2 and no timestamps.
pub fn issue(id: &str, issue_type: &str, description: &str) -> Issue {
    Issue {
        id: IssueId::new(id),
        title: format!("Title of {id}"),
        description: description.to_string(),
        status: IssueStatus::Open,
        issue_type: issue_type.to_string(),
        priority: 2,
        labels: Vec::new(),
        assignee: None,
        created_at: None,
        updated_at: None,
        blocked_by: Vec::new(),
        close_reason: None,
        created_by: None,
        active_mr: None,
    }
}

/// An open MR record targeting `main`.
pub fn mr_issue(id: &str, branch: &str) -> Issue {
    issue(
        id,
        MERGE_REQUEST_TYPE,
        &format!("branch: {branch}\ntarget: main\nworker: nux\nrig: gastown"),
    )
}

/// An unclaimed queue entry targeting `main`, priority 2, no timestamps.
pub fn mr(id: &str, branch: &str) -> MergeRequest {
    MergeRequest {
        id: IssueId::new(id),
        branch: branch.to_string(),
        target: "main".to_string(),
        source_issue: None,
        worker: "nux".to_string(),
        rig: "gastown".to_string(),
        title: format!("Title of {id}"),
        priority: 2,
        agent: None,
        retry_count: 0,
        convoy_id: None,
        convoy_created_at: None,
        created_at: None,
        updated_at: None,
        assignee: None,
        blocked_by: None,
    }
}

pub fn sha(c: char) -> Sha {
    Sha::new(c.to_string().repeat(40))
}

// --- issue store ---

#[derive(Default)]
struct MemoryIssuesState {
    issues: BTreeMap<IssueId, Issue>,
    next_id: u64,
    fail_create: bool,
    fail_dependency: bool,
}

/// In-memory issue store.
#[derive(Default)]
pub struct MemoryIssues {
    state: Mutex<MemoryIssuesState>,
}

impl MemoryIssues {
    pub fn insert(&self, issue: Issue) {
        lock(&self.state).issues.insert(issue.id.clone(), issue);
    }

    pub fn get(&self, id: &str) -> Option<Issue> {
        lock(&self.state).issues.get(&IssueId::new(id)).cloned()
    }

    pub fn all(&self) -> Vec<Issue> {
        lock(&self.state).issues.values().cloned().collect()
    }

    pub fn of_type(&self, issue_type: &str) -> Vec<Issue> {
        self.all()
            .into_iter()
            .filter(|i| i.issue_type == issue_type)
            .collect()
    }

    pub fn fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn fail_dependency(&self, fail: bool) {
        lock(&self.state).fail_dependency = fail;
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl IssueStore for MemoryIssues {
    fn list(&self, query: &IssueQuery) -> issues::Result<Vec<Issue>> {
        Ok(lock(&self.state)
            .issues
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect())
    }

    fn show(&self, id: &IssueId) -> issues::Result<Issue> {
        lock(&self.state)
            .issues
            .get(id)
            .cloned()
            .ok_or_else(|| IssueError::NotFound(id.clone()))
    }

    fn update(&self, id: &IssueId, update: &IssueUpdate) -> issues::Result<()> {
        let mut state = lock(&self.state);
        let issue = state
            .issues
            .get_mut(id)
            .ok_or_else(|| IssueError::NotFound(id.clone()))?;
        if let Some(assignee) = &update.assignee {
            issue.assignee = assignee.clone();
        }
        if let Some(description) = &update.description {
            issue.description = description.clone();
        }
        issue.labels.retain(|l| !update.remove_labels.contains(l));
        for label in &update.add_labels {
            if !issue.has_label(label) {
                issue.labels.push(label.clone());
            }
        }
        if let Some(active_mr) = &update.active_mr {
            issue.active_mr = active_mr.clone();
        }
        issue.updated_at = Some(Self::now());
        Ok(())
    }

    fn close(&self, id: &IssueId, reason: &str) -> issues::Result<()> {
        let mut state = lock(&self.state);
        let issue = state
            .issues
            .get_mut(id)
            .ok_or_else(|| IssueError::NotFound(id.clone()))?;
        issue.status = IssueStatus::Closed;
        issue.close_reason = Some(reason.to_string());
        Ok(())
    }

    fn add_dependency(&self, issue: &IssueId, depends_on: &IssueId) -> issues::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_dependency {
            return Err(IssueError::Backend("dependency edges unavailable".to_string()));
        }
        let record = state
            .issues
            .get_mut(issue)
            .ok_or_else(|| IssueError::NotFound(issue.clone()))?;
        if !record.blocked_by.contains(depends_on) {
            record.blocked_by.push(depends_on.clone());
        }
        Ok(())
    }

    fn create(&self, new: &NewIssue) -> issues::Result<Issue> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(IssueError::Backend("create rejected".to_string()));
        }
        state.next_id += 1;
        let now = Self::now();
        let mut created = issue(
            &format!("gt-new{}", state.next_id),
            &new.issue_type,
            &new.description,
        );
        created.title = new.title.clone();
        created.priority = new.priority;
        created.created_by = Some(new.actor.clone());
        created.created_at = Some(now.clone());
        created.updated_at = Some(now);
        state.issues.insert(created.id.clone(), created.clone());
        Ok(created)
    }
}

// --- merge slot ---

/// A real exclusive slot: one holder at a time.
#[derive(Default)]
pub struct MemorySlot {
    holder: Mutex<Option<String>>,
}

impl MemorySlot {
    pub fn holder(&self) -> Option<String> {
        lock(&self.holder).clone()
    }
}

impl SlotStore for MemorySlot {
    fn ensure_exists(&self) -> slot::Result<String> {
        Ok("gt-merge-slot".to_string())
    }

    fn acquire(&self, holder: &str, _add_waiter: bool) -> slot::Result<Option<SlotStatus>> {
        let mut current = lock(&self.holder);
        let available = current.is_none();
        if available {
            *current = Some(holder.to_string());
        }
        Ok(Some(SlotStatus {
            id: "gt-merge-slot".to_string(),
            available,
            holder: current.clone(),
            waiters: Vec::new(),
        }))
    }

    fn release(&self, holder: &str) -> slot::Result<()> {
        let mut current = lock(&self.holder);
        if current.as_deref() == Some(holder) {
            *current = None;
            Ok(())
        } else {
            Err(SlotError::NotHeld {
                holder: holder.to_string(),
                current: current.clone(),
            })
        }
    }
}

/// A slot that answers from a script. The last entry repeats.
pub struct ScriptedSlot {
    script: Mutex<VecDeque<Option<SlotStatus>>>,
    acquire_error: Option<String>,
    ensure_error: Option<String>,
    acquire_calls: AtomicUsize,
    releases: Mutex<Vec<String>>,
}

impl ScriptedSlot {
    pub fn new(script: Vec<Option<SlotStatus>>) -> Self {
        ScriptedSlot {
            script: Mutex::new(script.into()),
            acquire_error: None,
            ensure_error: None,
            acquire_calls: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_acquire(message: &str) -> Self {
        ScriptedSlot {
            acquire_error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn failing_ensure(message: &str) -> Self {
        ScriptedSlot {
            ensure_error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> Vec<String> {
        lock(&self.releases).clone()
    }
}

impl SlotStore for ScriptedSlot {
    fn ensure_exists(&self) -> slot::Result<String> {
        match &self.ensure_error {
            Some(message) => Err(SlotError::Store(message.clone())),
            None => Ok("gt-merge-slot".to_string()),
        }
    }

    fn acquire(&self, _holder: &str, _add_waiter: bool) -> slot::Result<Option<SlotStatus>> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.acquire_error {
            return Err(SlotError::Store(message.clone()));
        }
        let mut script = lock(&self.script);
        if script.len() > 1 {
            Ok(script.pop_front().flatten())
        } else {
            Ok(script.front().cloned().flatten())
        }
    }

    fn release(&self, holder: &str) -> slot::Result<()> {
        lock(&self.releases).push(holder.to_string());
        Ok(())
    }
}

/// A slot status showing `holder` as the current owner.
pub fn busy_slot(holder: &str) -> Option<SlotStatus> {
    Some(SlotStatus {
        id: "gt-merge-slot".to_string(),
        available: false,
        holder: Some(holder.to_string()),
        waiters: Vec::new(),
    })
}

/// A slot status reporting a free slot.
pub fn free_slot() -> Option<SlotStatus> {
    Some(SlotStatus {
        id: "gt-merge-slot".to_string(),
        available: true,
        holder: None,
        waiters: Vec::new(),
    })
}

// --- version control ---

/// Scripted outcomes for [`MockVcs`]. Unset errors mean success.
#[derive(Debug, Default)]
pub struct VcsState {
    pub local_branches: HashSet<String>,
    pub remote_branches: HashSet<String>,
    /// Branches whose existence checks fail.
    pub branch_check_errors: HashSet<String>,
    pub checkout_error: Option<String>,
    pub pull_error: Option<String>,
    pub conflicts: Vec<String>,
    pub conflict_probe_error: Option<String>,
    pub submodules: Vec<SubmoduleChange>,
    pub init_submodules_error: Option<String>,
    pub submodule_push_error: Option<String>,
    pub merge_error: Option<String>,
    /// Reported by `unmerged_files` after a failed merge.
    pub unmerged: Vec<String>,
    pub push_error: Option<String>,
    /// `rev_parse` answers.
    pub revs: HashMap<String, Sha>,
    pub head_message: Option<String>,
    pub head_date: Option<DateTime<FixedOffset>>,
    /// Every call, in order, as `op arg...`.
    pub calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockVcs {
    state: Mutex<VcsState>,
}

fn failure(command: &str, stderr: &str) -> GitError {
    GitError::CommandFailed {
        command: command.to_string(),
        stderr: stderr.to_string(),
    }
}

impl MockVcs {
    /// A worktree where `branch` exists locally and merges cleanly, with
    /// `HEAD` resolving to `c…c` and `origin/main` to `d…d`.
    pub fn ready(branch: &str) -> Self {
        let vcs = MockVcs::default();
        vcs.with(|s| {
            s.local_branches.insert(branch.to_string());
            s.revs.insert("HEAD".to_string(), sha('c'));
            s.revs.insert("origin/main".to_string(), sha('d'));
            s.head_message = Some("feat: add x".to_string());
        });
        vcs
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut VcsState) -> T) -> T {
        f(&mut lock(&self.state))
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Whether any call starts with `prefix`.
    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) -> MutexGuard<'_, VcsState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }

    fn outcome(error: &Option<String>, command: &str) -> GitResult<()> {
        match error {
            Some(stderr) => Err(failure(command, stderr)),
            None => Ok(()),
        }
    }
}

impl Vcs for MockVcs {
    async fn branch_exists(&self, branch: &str) -> GitResult<bool> {
        let state = self.record(format!("branch_exists {branch}"));
        if state.branch_check_errors.contains(branch) {
            return Err(failure("git show-ref", "lookup failed"));
        }
        Ok(state.local_branches.contains(branch))
    }

    async fn remote_tracking_branch_exists(&self, remote: &str, branch: &str) -> GitResult<bool> {
        let state = self.record(format!("remote_branch_exists {remote} {branch}"));
        if state.branch_check_errors.contains(branch) {
            return Err(failure("git show-ref", "lookup failed"));
        }
        Ok(state.remote_branches.contains(branch))
    }

    async fn checkout(&self, branch: &str) -> GitResult<()> {
        let state = self.record(format!("checkout {branch}"));
        Self::outcome(&state.checkout_error, "git checkout")
    }

    async fn pull(&self, remote: &str, branch: &str) -> GitResult<()> {
        let state = self.record(format!("pull {remote} {branch}"));
        Self::outcome(&state.pull_error, "git pull")
    }

    async fn conflicting_files(&self, branch: &str, target: &str) -> GitResult<Vec<String>> {
        let state = self.record(format!("conflicting_files {branch} {target}"));
        Self::outcome(&state.conflict_probe_error, "git merge-tree")?;
        Ok(state.conflicts.clone())
    }

    async fn submodule_changes(&self, base: &str, branch: &str) -> GitResult<Vec<SubmoduleChange>> {
        let state = self.record(format!("submodule_changes {base} {branch}"));
        Ok(state.submodules.clone())
    }

    async fn init_submodules(&self) -> GitResult<()> {
        let state = self.record("init_submodules".to_string());
        Self::outcome(&state.init_submodules_error, "git submodule update")
    }

    async fn push_submodule_commit(&self, path: &str, sha: &Sha, remote: &str) -> GitResult<()> {
        let state = self.record(format!("push_submodule {path} {sha} {remote}"));
        Self::outcome(&state.submodule_push_error, "git push")
    }

    async fn merge_squash(
        &self,
        branch: &str,
        message: &str,
        _commit_date: Option<DateTime<FixedOffset>>,
    ) -> GitResult<()> {
        let state = self.record(format!("merge_squash {branch} {message}"));
        Self::outcome(&state.merge_error, "git merge --squash")
    }

    async fn unmerged_files(&self) -> GitResult<Vec<String>> {
        let state = self.record("unmerged_files".to_string());
        Ok(state.unmerged.clone())
    }

    async fn abort_merge(&self) -> GitResult<()> {
        let mut state = self.record("abort_merge".to_string());
        state.unmerged.clear();
        Ok(())
    }

    async fn push(&self, remote: &str, branch: &str) -> GitResult<()> {
        let state = self.record(format!("push {remote} {branch}"));
        Self::outcome(&state.push_error, "git push")
    }

    async fn reset_hard(&self, rev: &str) -> GitResult<()> {
        drop(self.record(format!("reset_hard {rev}")));
        Ok(())
    }

    async fn rev_parse(&self, rev: &str) -> GitResult<Sha> {
        let state = self.record(format!("rev_parse {rev}"));
        state
            .revs
            .get(rev)
            .cloned()
            .ok_or_else(|| failure("git rev-parse", "unknown revision"))
    }

    async fn head_commit_message(&self, branch: &str) -> GitResult<String> {
        let state = self.record(format!("head_commit_message {branch}"));
        state
            .head_message
            .clone()
            .ok_or_else(|| failure("git log", "no message"))
    }

    async fn head_commit_date(&self, branch: &str) -> GitResult<DateTime<FixedOffset>> {
        let state = self.record(format!("head_commit_date {branch}"));
        state
            .head_date
            .ok_or_else(|| failure("git log", "no date"))
    }

    async fn delete_branch(&self, branch: &str, force: bool) -> GitResult<()> {
        let mut state = self.record(format!("delete_branch {branch} {force}"));
        state.local_branches.remove(branch);
        Ok(())
    }
}

// --- test runner ---

#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Pass,
    Fail(String),
    Cancelled,
    Timeout,
}

/// Runner that replays a script. Once the script runs out every run passes.
#[derive(Default)]
pub struct MockRunner {
    script: Mutex<VecDeque<ScriptedRun>>,
    commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        MockRunner {
            script: Mutex::new(script.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn runs(&self) -> usize {
        lock(&self.commands).len()
    }
}

impl CommandRunner for MockRunner {
    async fn run(
        &self,
        command: &str,
        _workdir: &Path,
        timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunError> {
        lock(&self.commands).push(command.to_string());
        let next = lock(&self.script).pop_front().unwrap_or(ScriptedRun::Pass);
        match next {
            ScriptedRun::Pass => Ok(CommandOutput {
                success: true,
                code: Some(0),
                stdout: "ok\n".to_string(),
                stderr: String::new(),
            }),
            ScriptedRun::Fail(stderr) => Ok(CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr,
            }),
            ScriptedRun::Cancelled => Err(RunError::Cancelled),
            ScriptedRun::Timeout => Err(RunError::Timeout(timeout)),
        }
    }
}

// --- mail ---

/// Notifier that keeps every message it is given.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Message>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, message: &Message) -> mail::Result<()> {
        if message.to.is_empty() {
            return Err(MailError::InvalidRecipient(String::new()));
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

// --- real git ---

/// Runs git synchronously with a clean environment, panicking on failure.
/// Returns trimmed stdout.
pub fn git_sync(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_TERMINAL_PROMPT", "0")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed in {}: {}",
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare `origin` with one commit on `main`, and a working clone of it.
pub struct TestRepo {
    _dir: TempDir,
    pub origin: PathBuf,
    pub work: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("origin.git");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::create_dir_all(&work).unwrap();

        git_sync(&origin, &["init", "-q", "--bare"]);
        git_sync(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git_sync(&work, &["init", "-q"]);
        git_sync(&work, &["config", "user.email", "test@example.com"]);
        git_sync(&work, &["config", "user.name", "Test"]);
        git_sync(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(work.join("README.md"), "# Test\n").unwrap();
        git_sync(&work, &["add", "README.md"]);
        git_sync(&work, &["commit", "-q", "-m", "Initial commit"]);
        git_sync(&work, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git_sync(&work, &["push", "-q", "-u", "origin", "main"]);

        TestRepo {
            _dir: dir,
            origin,
            work,
        }
    }

    /// Creates local `branch` off `main` with one commit, then returns to `main`.
    pub fn branch_with_file(&self, branch: &str, file: &str, content: &str, message: &str) {
        git_sync(&self.work, &["checkout", "-q", "-b", branch, "main"]);
        self.write_and_commit(file, content, message);
        git_sync(&self.work, &["checkout", "-q", "main"]);
    }

    /// Commits on `main` and pushes it to `origin`.
    pub fn commit_on_main(&self, file: &str, content: &str, message: &str) {
        git_sync(&self.work, &["checkout", "-q", "main"]);
        self.write_and_commit(file, content, message);
        git_sync(&self.work, &["push", "-q", "origin", "main"]);
    }

    fn write_and_commit(&self, file: &str, content: &str, message: &str) {
        let path = self.work.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        git_sync(&self.work, &["add", file]);
        git_sync(&self.work, &["commit", "-q", "-m", message]);
    }
}
