//! Narrow, read-only view onto a project's version control state.
//!
//! The core never shells out to a VCS tool directly; every caller goes
//! through [`GitVcs`]. The operations here are intentionally small and
//! best-effort: callers (the Actor, the Eviction Engine) treat VCS
//! unavailability as a degraded-but-safe mode rather than a hard failure.

use std::process::Stdio;

use color_eyre::Result;
use color_eyre::eyre::Context;
use tap::Pipe;
use tokio::process::Command;
use tracing::{instrument, trace, warn};

use crate::path::AbsDirPath;

/// Branch name reported when the worktree is in a detached-HEAD state.
const DETACHED_PREFIX: &str = "detached-";

/// Branch name reported when no VCS information is available at all.
const UNKNOWN_BRANCH: &str = "unknown";

/// Read-only version control operations, backed by shelling out to `git`.
///
/// Grounded in the `tokio::process::Command` invocation pattern used
/// throughout the teacher's `cargo.rs` (spawn, `.context(...)`, inspect
/// `ExitStatus`), generalized to git subcommands.
#[derive(Clone, Copy, Debug, Default)]
pub struct GitVcs;

impl GitVcs {
    /// The current branch name.
    ///
    /// For a detached HEAD, returns `"detached-" + short-hash`. If no VCS
    /// info is available at all (not a repository, `git` missing, etc.),
    /// returns `"unknown"`. This function never fails.
    #[instrument(name = "GitVcs::current_branch")]
    pub async fn current_branch(&self, path: &AbsDirPath) -> String {
        match self
            .run(path, &["symbolic-ref", "--short", "-q", "HEAD"])
            .await
        {
            Ok(Some(branch)) if !branch.is_empty() => return branch,
            _ => {}
        }

        match self.run(path, &["rev-parse", "--short", "HEAD"]).await {
            Ok(Some(hash)) if !hash.is_empty() => format!("{DETACHED_PREFIX}{hash}"),
            _ => UNKNOWN_BRANCH.to_string(),
        }
    }

    /// The mainline branch a feature branch diverged from.
    ///
    /// Returns `"main"` if a common history exists with `main`, else
    /// `"master"` if that exists, else `""`. Querying with `branch ==
    /// "main"` when `main` exists returns `"main"` (a self-merge-base
    /// always succeeds; see spec Design Notes #3).
    #[instrument(name = "GitVcs::ancestor_branch")]
    pub async fn ancestor_branch(&self, path: &AbsDirPath, branch: &str) -> String {
        for candidate in ["main", "master"] {
            if branch == candidate {
                if self.has_merge_base(path, candidate, candidate).await {
                    return candidate.to_string();
                }
                continue;
            }
            if self.has_merge_base(path, branch, candidate).await {
                return candidate.to_string();
            }
        }
        String::new()
    }

    async fn has_merge_base(&self, path: &AbsDirPath, a: &str, b: &str) -> bool {
        matches!(
            self.status(path, &["merge-base", a, b]).await,
            Ok(status) if status.success()
        )
    }

    /// Raw branch listing, preserving the `"* "` marker on the current
    /// branch and any remote-tracking / `HEAD ->` alias lines. Callers
    /// (the Eviction Engine) are responsible for normalizing this output.
    ///
    /// Unlike the other operations on this type, this one can fail: callers
    /// that need to distinguish "VCS unavailable" from "repository has no
    /// branches" (the Eviction Engine) rely on that.
    #[instrument(name = "GitVcs::branches")]
    pub async fn branches(&self, path: &AbsDirPath) -> Result<Vec<String>> {
        let output = self.run_required(path, &["branch", "-a"]).await?;
        Ok(output
            .lines()
            .map(|line| line.to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// The preferred remote's URL: `origin` if present, else the first
    /// remote reported by `git remote`. Empty string if there are none.
    #[instrument(name = "GitVcs::remote_url")]
    pub async fn remote_url(&self, path: &AbsDirPath) -> String {
        if let Ok(Some(url)) = self.run(path, &["remote", "get-url", "origin"]).await {
            if !url.is_empty() {
                return url;
            }
        }

        let Ok(Some(remotes)) = self.run(path, &["remote"]).await else {
            return String::new();
        };
        let Some(first) = remotes.lines().next() else {
            return String::new();
        };
        self.run(path, &["remote", "get-url", first])
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// The absolute path to the worktree root. Falls back to `path` itself
    /// when it is not inside a VCS worktree at all.
    #[instrument(name = "GitVcs::worktree_root")]
    pub async fn worktree_root(&self, path: &AbsDirPath) -> String {
        match self
            .run(path, &["rev-parse", "--show-toplevel"])
            .await
        {
            Ok(Some(root)) if !root.is_empty() => root,
            _ => path.as_str_lossy().into_owned(),
        }
    }

    /// Run `git <args>` in `path`, returning trimmed stdout on success and
    /// `None` on non-zero exit. Spawn failures (missing `git`, etc.) are
    /// logged and reported as `Ok(None)` rather than surfaced as errors,
    /// matching the "must never fail" contract of most VCS operations.
    async fn run(&self, path: &AbsDirPath, args: &[&str]) -> Result<Option<String>> {
        let output = Command::new("git")
            .args(args)
            .current_dir(path.as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                warn!(?path, ?args, error = ?err, "failed to spawn git");
                return Ok(None);
            }
        };

        if !output.status.success() {
            trace!(?path, ?args, status = ?output.status, "git exited non-zero");
            return Ok(None);
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .to_string()
            .pipe(Some)
            .pipe(Ok)
    }

    /// Like [`Self::run`], but surfaces both spawn failures and non-zero
    /// exits as an `Err` instead of swallowing them into `Ok(None)`.
    async fn run_required(&self, path: &AbsDirPath, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(path.as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawn git {args:?}"))?;

        if !output.status.success() {
            color_eyre::eyre::bail!(
                "git {args:?} exited with {status:?}: {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn status(&self, path: &AbsDirPath, args: &[&str]) -> Result<std::process::ExitStatus> {
        Command::new("git")
            .args(args)
            .current_dir(path.as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::process::Command as TestCommand;

    use super::*;

    async fn init_repo(path: &std::path::Path) {
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            TestCommand::new("git")
                .args(&args)
                .current_dir(path)
                .status()
                .await
                .expect("run git");
        }
        tokio::fs::write(path.join("README.md"), b"hello")
            .await
            .expect("write file");
        for args in [vec!["add", "."], vec!["commit", "-q", "-m", "init"]] {
            TestCommand::new("git")
                .args(&args)
                .current_dir(path)
                .status()
                .await
                .expect("run git");
        }
    }

    #[test_log::test(tokio::test)]
    async fn current_branch_reports_main_on_fresh_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        assert_eq!(vcs.current_branch(&path).await, "main");
    }

    #[test_log::test(tokio::test)]
    async fn current_branch_unknown_outside_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        assert_eq!(vcs.current_branch(&path).await, UNKNOWN_BRANCH);
    }

    #[test_log::test(tokio::test)]
    async fn ancestor_branch_of_main_is_main() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        assert_eq!(vcs.ancestor_branch(&path, "main").await, "main");
    }

    #[test_log::test(tokio::test)]
    async fn remote_url_empty_without_remote() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        assert_eq!(vcs.remote_url(&path).await, "");
    }

    #[test_log::test(tokio::test)]
    async fn branches_lists_current_branch() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        let branches = vcs.branches(&path).await.expect("branches");
        assert!(branches.iter().any(|b| b.contains("main")));
    }

    #[test_log::test(tokio::test)]
    async fn branches_errs_outside_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        assert!(vcs.branches(&path).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn worktree_root_matches_repo_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).expect("typed path");

        let vcs = GitVcs;
        let root = vcs.worktree_root(&path).await;
        let canonical = tokio::fs::canonicalize(dir.path())
            .await
            .expect("canonicalize");
        assert_eq!(
            tokio::fs::canonicalize(&root).await.expect("canonicalize"),
            canonical
        );
    }
}
