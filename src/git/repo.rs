//! [`Vcs`] implementation that shells out to the `git` CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, info};

use super::vcs::{SubmoduleChange, Vcs, parse_merge_tree_conflicts, parse_submodule_changes};
use super::{
    CommitIdentity, GitError, GitResult, check_success, exists_from_exit, git_command,
    git_commit_command, output_with_timeout, run_git, run_git_stdout,
};
use crate::types::Sha;

/// A local git worktree, typically the refinery's checkout of the rig repo.
#[derive(Debug, Clone)]
pub struct GitRepo {
    workdir: PathBuf,
    identity: CommitIdentity,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(workdir: impl Into<PathBuf>, identity: CommitIdentity, timeout: Duration) -> Self {
        GitRepo {
            workdir: workdir.into(),
            identity,
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn git(&self, args: &[&str]) -> GitResult<()> {
        run_git(&self.workdir, args, self.timeout).await?;
        Ok(())
    }

    async fn git_stdout(&self, args: &[&str]) -> GitResult<String> {
        run_git_stdout(&self.workdir, args, self.timeout).await
    }

    async fn ref_exists(&self, full_ref: &str) -> GitResult<bool> {
        let args = ["show-ref", "--verify", "--quiet", full_ref];
        let display = format!("git {}", args.join(" "));
        let output =
            output_with_timeout(git_command(&self.workdir).args(args), &display, self.timeout)
                .await?;
        exists_from_exit(display, output)
    }

    /// Default branch of a submodule's `origin`, falling back to `main`.
    async fn submodule_default_branch(&self, sub_dir: &Path) -> String {
        let head = run_git_stdout(
            sub_dir,
            &["rev-parse", "--abbrev-ref", "origin/HEAD"],
            self.timeout,
        )
        .await
        .ok();
        head.as_deref()
            .and_then(|h| h.strip_prefix("origin/"))
            .filter(|b| !b.is_empty())
            .unwrap_or("main")
            .to_string()
    }

    /// Author of the commit at the tip of `branch`, as `Name <email>`.
    async fn head_author(&self, branch: &str) -> GitResult<String> {
        self.git_stdout(&["log", "-1", "--format=%an <%ae>", branch, "--"])
            .await
    }

    async fn has_staged_changes(&self) -> GitResult<bool> {
        let args = ["diff", "--cached", "--quiet"];
        let display = format!("git {}", args.join(" "));
        let output =
            output_with_timeout(git_command(&self.workdir).args(args), &display, self.timeout)
                .await?;
        // `--quiet` exits 1 when there are differences.
        exists_from_exit(display, output).map(|clean| !clean)
    }
}

impl Vcs for GitRepo {
    async fn branch_exists(&self, branch: &str) -> GitResult<bool> {
        self.ref_exists(&format!("refs/heads/{branch}")).await
    }

    async fn remote_tracking_branch_exists(&self, remote: &str, branch: &str) -> GitResult<bool> {
        self.ref_exists(&format!("refs/remotes/{remote}/{branch}"))
            .await
    }

    async fn checkout(&self, branch: &str) -> GitResult<()> {
        self.git(&["checkout", "-q", branch]).await
    }

    async fn pull(&self, remote: &str, branch: &str) -> GitResult<()> {
        self.git(&["pull", "-q", "--ff-only", remote, branch]).await
    }

    async fn conflicting_files(&self, branch: &str, target: &str) -> GitResult<Vec<String>> {
        let args = [
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--no-messages",
            target,
            branch,
        ];
        let display = format!("git {}", args.join(" "));
        let output =
            output_with_timeout(git_command(&self.workdir).args(args), &display, self.timeout)
                .await?;
        match output.status.code() {
            Some(0) => Ok(Vec::new()),
            Some(1) => {
                let files = parse_merge_tree_conflicts(&String::from_utf8_lossy(&output.stdout));
                if files.is_empty() {
                    Err(GitError::UnexpectedOutput {
                        command: display,
                        output: String::from_utf8_lossy(&output.stdout).into_owned(),
                    })
                } else {
                    Ok(files)
                }
            }
            _ => check_success(display, output).map(|_| Vec::new()),
        }
    }

    async fn submodule_changes(&self, base: &str, branch: &str) -> GitResult<Vec<SubmoduleChange>> {
        let range = format!("{base}...{branch}");
        let raw = self
            .git_stdout(&["diff", "--raw", "--no-abbrev", &range])
            .await?;
        Ok(parse_submodule_changes(&raw))
    }

    async fn init_submodules(&self) -> GitResult<()> {
        self.git(&["submodule", "update", "--init", "--recursive"])
            .await
    }

    async fn push_submodule_commit(&self, path: &str, sha: &Sha, remote: &str) -> GitResult<()> {
        let sub_dir = self.workdir.join(path);
        let branch = self.submodule_default_branch(&sub_dir).await;
        let refspec = format!("{sha}:refs/heads/{branch}");
        info!(submodule = %path, sha = %sha.short(), branch = %branch, "pushing submodule commit");
        run_git(&sub_dir, &["push", remote, &refspec], self.timeout).await?;
        Ok(())
    }

    async fn merge_squash(
        &self,
        branch: &str,
        message: &str,
        commit_date: Option<DateTime<FixedOffset>>,
    ) -> GitResult<()> {
        self.git(&["merge", "--squash", "-q", branch]).await?;

        if !self.has_staged_changes().await? {
            info!(branch = %branch, "branch already contained in target, nothing to commit");
            return Ok(());
        }

        let author = self.head_author(branch).await?;
        let args = ["commit", "-q", "--no-verify", "--author", &author, "-m", message];
        let mut cmd = git_commit_command(&self.workdir, &self.identity);
        cmd.args(args);
        if let Some(date) = commit_date {
            let date = date.to_rfc3339();
            cmd.env("GIT_AUTHOR_DATE", &date);
            cmd.env("GIT_COMMITTER_DATE", &date);
        }
        let display = format!("git commit --author {author} -m <message>");
        let output = output_with_timeout(&mut cmd, &display, self.timeout).await?;
        check_success(display, output)?;
        Ok(())
    }

    async fn unmerged_files(&self) -> GitResult<Vec<String>> {
        let out = self
            .git_stdout(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn abort_merge(&self) -> GitResult<()> {
        // Squash merges leave no MERGE_HEAD, so `merge --abort` refuses them.
        if let Err(e) = self.git(&["merge", "--abort"]).await {
            debug!(error = %e, "merge --abort failed, resetting instead");
            self.git(&["reset", "-q", "--hard", "HEAD"]).await?;
        }
        Ok(())
    }

    async fn push(&self, remote: &str, branch: &str) -> GitResult<()> {
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        self.git(&["push", "-q", remote, &refspec]).await
    }

    async fn reset_hard(&self, rev: &str) -> GitResult<()> {
        self.git(&["reset", "-q", "--hard", rev]).await
    }

    async fn rev_parse(&self, rev: &str) -> GitResult<Sha> {
        let out = self.git_stdout(&["rev-parse", "--verify", rev]).await?;
        Ok(Sha::parse(out)?)
    }

    async fn head_commit_message(&self, branch: &str) -> GitResult<String> {
        let msg = self
            .git_stdout(&["log", "-1", "--format=%B", branch, "--"])
            .await?;
        if msg.is_empty() {
            return Err(GitError::UnexpectedOutput {
                command: format!("git log -1 --format=%B {branch}"),
                output: msg,
            });
        }
        Ok(msg)
    }

    async fn head_commit_date(&self, branch: &str) -> GitResult<DateTime<FixedOffset>> {
        let out = self
            .git_stdout(&["log", "-1", "--format=%cI", branch, "--"])
            .await?;
        DateTime::parse_from_rfc3339(&out).map_err(|_| GitError::UnexpectedOutput {
            command: format!("git log -1 --format=%cI {branch}"),
            output: out,
        })
    }

    async fn delete_branch(&self, branch: &str, force: bool) -> GitResult<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", "-q", flag, branch]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestRepo, git_sync};

    fn repo_for(test: &TestRepo) -> GitRepo {
        GitRepo::new(
            test.work.clone(),
            CommitIdentity::refinery("gastown"),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn branch_existence_local_and_remote() {
        let test = TestRepo::new();
        test.branch_with_file("polecat/nux", "nux.txt", "hello\n", "feat: nux");
        let repo = repo_for(&test);

        assert!(repo.branch_exists("polecat/nux").await.unwrap());
        assert!(!repo.branch_exists("polecat/ghost").await.unwrap());
        assert!(repo.remote_tracking_branch_exists("origin", "main").await.unwrap());
        assert!(
            !repo
                .remote_tracking_branch_exists("origin", "polecat/nux")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn conflict_probe_finds_nothing_for_disjoint_changes() {
        let test = TestRepo::new();
        test.branch_with_file("feature", "feature.txt", "feature content", "add feature file");
        let repo = repo_for(&test);

        let conflicts = repo.conflicting_files("feature", "main").await.unwrap();
        assert!(conflicts.is_empty(), "got {conflicts:?}");

        // The probe must not touch the worktree.
        assert_eq!(git_sync(&test.work, &["status", "--porcelain"]), "");
        assert_eq!(git_sync(&test.work, &["branch", "--show-current"]), "main");
    }

    #[tokio::test]
    async fn conflict_probe_reports_conflicting_paths() {
        let test = TestRepo::new();
        test.branch_with_file("feature", "README.md", "# Feature changes\n", "modify readme");
        test.commit_on_main("README.md", "# Main changes\n", "modify readme on main");
        let repo = repo_for(&test);

        let conflicts = repo.conflicting_files("feature", "main").await.unwrap();
        assert_eq!(conflicts, vec!["README.md".to_string()]);
        assert_eq!(git_sync(&test.work, &["status", "--porcelain"]), "");
    }

    #[tokio::test]
    async fn squash_merge_reuses_message_and_is_reproducible() {
        let test = TestRepo::new();
        test.branch_with_file("feature/x", "x.txt", "x\n", "feat: add x");
        let repo = repo_for(&test);

        let msg = repo.head_commit_message("feature/x").await.unwrap();
        assert_eq!(msg, "feat: add x");
        let date = repo.head_commit_date("feature/x").await.unwrap();

        repo.checkout("main").await.unwrap();
        repo.merge_squash("feature/x", &msg, Some(date)).await.unwrap();
        let first = repo.rev_parse("HEAD").await.unwrap();

        repo.reset_hard("origin/main").await.unwrap();
        repo.merge_squash("feature/x", &msg, Some(date)).await.unwrap();
        let second = repo.rev_parse("HEAD").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(git_sync(&test.work, &["log", "-1", "--format=%s"]), "feat: add x");
        assert_eq!(
            git_sync(&test.work, &["rev-list", "--count", "origin/main..HEAD"]),
            "1"
        );
    }

    #[tokio::test]
    async fn squash_of_already_merged_branch_is_a_no_op() {
        let test = TestRepo::new();
        test.branch_with_file("feature/x", "x.txt", "x\n", "feat: add x");
        let repo = repo_for(&test);

        repo.checkout("main").await.unwrap();
        repo.merge_squash("feature/x", "feat: add x", None).await.unwrap();
        let merged = repo.rev_parse("HEAD").await.unwrap();

        repo.merge_squash("feature/x", "feat: add x", None).await.unwrap();
        assert_eq!(repo.rev_parse("HEAD").await.unwrap(), merged);
    }

    #[tokio::test]
    async fn conflicting_squash_leaves_unmerged_files_until_aborted() {
        let test = TestRepo::new();
        test.branch_with_file("feature", "README.md", "# Feature\n", "modify readme");
        test.commit_on_main("README.md", "# Main\n", "modify readme on main");
        let repo = repo_for(&test);

        repo.checkout("main").await.unwrap();
        assert!(repo.merge_squash("feature", "msg", None).await.is_err());
        assert_eq!(
            repo.unmerged_files().await.unwrap(),
            vec!["README.md".to_string()]
        );

        repo.abort_merge().await.unwrap();
        assert!(repo.unmerged_files().await.unwrap().is_empty());
        assert_eq!(git_sync(&test.work, &["status", "--porcelain"]), "");
    }

    #[tokio::test]
    async fn push_and_delete_branch() {
        let test = TestRepo::new();
        test.branch_with_file("feature/x", "x.txt", "x\n", "feat: add x");
        let repo = repo_for(&test);

        repo.checkout("main").await.unwrap();
        repo.merge_squash("feature/x", "feat: add x", None).await.unwrap();
        let head = repo.rev_parse("HEAD").await.unwrap();
        repo.push("origin", "main").await.unwrap();
        assert_eq!(
            git_sync(&test.origin, &["rev-parse", "refs/heads/main"]),
            head.as_str()
        );

        repo.delete_branch("feature/x", true).await.unwrap();
        assert!(!repo.branch_exists("feature/x").await.unwrap());
    }

    #[tokio::test]
    async fn rev_parse_of_missing_ref_fails() {
        let test = TestRepo::new();
        let repo = repo_for(&test);
        assert!(repo.rev_parse("origin/nope").await.is_err());
    }

    #[tokio::test]
    async fn detects_submodule_pointer_change() {
        let test = TestRepo::new();
        let sub = TestRepo::new();
        let sub_url = sub.origin.to_str().unwrap().to_string();

        git_sync(
            &test.work,
            &["-c", "protocol.file.allow=always", "submodule", "add", "-q", &sub_url, "libs/sub"],
        );
        git_sync(&test.work, &["commit", "-q", "-m", "add submodule"]);
        git_sync(&test.work, &["push", "-q", "origin", "main"]);

        git_sync(&test.work, &["checkout", "-q", "-b", "feature/sub"]);
        let sub_dir = test.work.join("libs/sub");
        git_sync(&sub_dir, &["config", "user.email", "test@example.com"]);
        git_sync(&sub_dir, &["config", "user.name", "Test"]);
        std::fs::write(sub_dir.join("new.txt"), "new\n").unwrap();
        git_sync(&sub_dir, &["add", "new.txt"]);
        git_sync(&sub_dir, &["commit", "-q", "-m", "sub change"]);
        let new_sha = git_sync(&sub_dir, &["rev-parse", "HEAD"]);
        git_sync(&test.work, &["add", "libs/sub"]);
        git_sync(&test.work, &["commit", "-q", "-m", "bump sub"]);
        git_sync(&test.work, &["checkout", "-q", "main"]);

        let repo = repo_for(&test);
        let changes = repo.submodule_changes("main", "feature/sub").await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "libs/sub");
        assert_eq!(changes[0].new_sha, Some(Sha::new(new_sha.clone())));

        repo.push_submodule_commit("libs/sub", &Sha::new(new_sha.clone()), "origin")
            .await
            .unwrap();
        assert_eq!(git_sync(&sub.origin, &["rev-parse", "refs/heads/main"]), new_sha);
    }
}
