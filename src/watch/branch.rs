//! Branch Watcher: observes a project's HEAD pointer and reports branch
//! switches (spec.md §4.7).

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{instrument, trace, warn};

use crate::fs;
use crate::path::AbsDirPath;
use crate::vcs::GitVcs;

/// How long to wait, after the most recent HEAD write, before re-reading the
/// branch. Any further write resets this window (spec.md §4.7, §8).
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches a project's VCS HEAD pointer and invokes a callback with
/// `(old_branch, new_branch)` whenever the checked-out branch changes.
///
/// The observer starts immediately in [`BranchWatcher::new`]; there is no
/// separate `Start()` (unlike [`crate::watch::file::FileWatcher`]), matching
/// spec.md §4.7's "start a background observer immediately."
pub struct BranchWatcher {
    _watcher: RecommendedWatcher,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BranchWatcher {
    /// Construct and immediately start watching `project_path`'s HEAD
    /// pointer. `on_change` is invoked on every detected branch switch; it
    /// is optional ("If the callback is absent, perform the diff but skip
    /// invocation," spec.md §4.7) — pass `None` for no notification.
    ///
    /// Fails if the HEAD pointer cannot be located or watched (e.g. the
    /// project has no VCS metadata directory).
    #[instrument(name = "BranchWatcher::new", skip(vcs, on_change))]
    pub async fn new(
        vcs: GitVcs,
        project_path: AbsDirPath,
        on_change: Option<impl Fn(String, String) + Send + Sync + 'static>,
    ) -> Result<Self> {
        let head_path = head_pointer_path(&project_path).await?;
        if !fs::is_file(&head_path).await {
            bail!("HEAD pointer does not exist: {head_path:?}");
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if is_write_class(&event.kind) => {
                    let _ = raw_tx.send(());
                }
                Ok(_) => {}
                Err(err) => warn!(error = ?err, "branch watcher observation error"),
            }
        })
        .context("create HEAD watcher")?;
        watcher
            .watch(&head_path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch HEAD pointer {head_path:?}"))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let current_branch = vcs.current_branch(&project_path).await;
        let on_change = on_change.map(|f| Box::new(f) as Box<dyn Fn(String, String) + Send + Sync>);

        let task = tokio::spawn(async move {
            let mut current_branch = current_branch;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    received = raw_rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                        // Drain further events for DEBOUNCE, resetting on each new one.
                        loop {
                            tokio::select! {
                                _ = tokio::time::sleep(DEBOUNCE) => break,
                                next = raw_rx.recv() => {
                                    if next.is_none() {
                                        break;
                                    }
                                }
                            }
                        }

                        let new_branch = vcs.current_branch(&project_path).await;
                        if new_branch != current_branch {
                            let old_branch = std::mem::replace(&mut current_branch, new_branch.clone());
                            trace!(old = %old_branch, new = %new_branch, "branch switch detected");
                            if let Some(callback) = on_change.as_ref() {
                                callback(old_branch, new_branch);
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop the observer and release the watch. Idempotent.
    #[instrument(name = "BranchWatcher::close", skip(self))]
    pub async fn close(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

fn is_write_class(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// The path to the HEAD pointer file inside `project_path`'s VCS metadata
/// directory, resolving the `.git`-file-redirect case used by worktrees and
/// submodules (`.git` containing `gitdir: <path>`).
async fn head_pointer_path(project_path: &AbsDirPath) -> Result<PathBuf> {
    let dot_git = project_path.as_std_path().join(".git");

    if fs::is_dir(&dot_git).await {
        return Ok(dot_git.join("HEAD"));
    }

    let Some(content) = tokio::fs::read_to_string(&dot_git)
        .await
        .ok()
        .filter(|s| !s.is_empty())
    else {
        bail!("no .git directory or file at {project_path:?}");
    };

    let Some(rest) = content.trim().strip_prefix("gitdir: ") else {
        bail!(".git file at {project_path:?} has unrecognized format");
    };

    let gitdir = if Path::new(rest).is_absolute() {
        PathBuf::from(rest)
    } else {
        project_path.as_std_path().join(rest)
    };
    Ok(gitdir.join("HEAD"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    async fn init_repo(path: &std::path::Path) {
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            tokio::process::Command::new("git")
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
            tokio::process::Command::new("git")
                .args(&args)
                .current_dir(path)
                .status()
                .await
                .expect("run git");
        }
    }

    #[test_log::test(tokio::test)]
    async fn construction_fails_without_vcs_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();

        let result = BranchWatcher::new(GitVcs, path, None::<fn(String, String)>).await;
        assert!(result.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn detects_branch_switch() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let path = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();

        tokio::process::Command::new("git")
            .args(["checkout", "-q", "-b", "feature"])
            .current_dir(dir.path())
            .status()
            .await
            .expect("create branch");
        tokio::process::Command::new("git")
            .args(["checkout", "-q", "main"])
            .current_dir(dir.path())
            .status()
            .await
            .expect("back to main");

        let events: Arc<AsyncMutex<Vec<(String, String)>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let events_for_cb = events.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let count_for_cb = count.clone();

        let watcher = BranchWatcher::new(
            GitVcs,
            path.clone(),
            Some(move |old: String, new: String| {
                count_for_cb.fetch_add(1, Ordering::SeqCst);
                let events = events_for_cb.clone();
                tokio::spawn(async move {
                    events.lock().await.push((old, new));
                });
            }),
        )
        .await
        .expect("construct watcher");

        tokio::process::Command::new("git")
            .args(["checkout", "-q", "feature"])
            .current_dir(dir.path())
            .status()
            .await
            .expect("checkout feature");

        tokio::time::sleep(Duration::from_millis(500)).await;

        let seen = events.lock().await.clone();
        assert_eq!(seen, vec![("main".to_string(), "feature".to_string())]);

        watcher.close().await;
        watcher.close().await;
    }
}
