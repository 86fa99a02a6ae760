//! Actor: the per-project concurrency unit (spec.md §4.9).
//!
//! Owns the settings view, the current branch, a branch watcher, a file
//! watcher, a progress subscriber table, and the atomic status fields the
//! Server reads through `GetStatus`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use color_eyre::Result;
use color_eyre::eyre::{Context, bail, eyre};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::identity::CacheKey;
use crate::cache::layout::ensure_cache_location;
use crate::cache::metadata::{CacheMetadata, branch_artifact_size_mb};
use crate::cache::settings::Settings;
use crate::fs;
use crate::indexer::{Embedder, IndexStats, Indexer};
use crate::path::{AbsDirPath, AbsFilePath};
use crate::vcs::GitVcs;
use crate::watch::branch::BranchWatcher;
use crate::watch::file::FileWatcher;

/// Message returned when an `Index` call lands on an actor already
/// indexing (spec.md §4.9/§7/§8 property 6).
pub const ALREADY_INDEXING: &str = "already indexing";

/// Bounded progress-subscriber channel capacity (spec.md §4.9: "capacity
/// `>= 10`").
const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// File extensions the per-project file watcher monitors by default.
const DEFAULT_MONITORED_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "c", "h", "cpp", "hpp", "cc", "rb", "php",
    "cs", "swift", "kt", "scala", "md", "json", "toml", "yaml", "yml",
];

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Unspecified,
    Indexing,
    Complete,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Indexing,
            2 => Phase::Complete,
            _ => Phase::Unspecified,
        }
    }
}

/// Progress frame emitted by `Index` and forwarded to subscribers
/// (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexProgress {
    pub phase: Phase,
    pub files_total: u64,
    pub files_processed: u64,
    pub chunks_generated: u64,
    pub current_file: Option<String>,
    pub message: String,
}

/// Snapshot returned by `GetStatus` (spec.md §4.9).
#[derive(Clone, Debug, Serialize)]
pub struct ProjectStatus {
    pub path: String,
    pub cache_key: String,
    pub current_branch: String,
    pub files_indexed: u64,
    pub chunks_count: u64,
    pub registered_at: Timestamp,
    pub last_indexed_at: Timestamp,
    pub is_indexing: bool,
    pub current_phase: Phase,
}

enum ActorEvent {
    BranchSwitch(String, String),
    FileBatch(Vec<std::path::PathBuf>),
}

/// The per-project concurrency unit.
pub struct Actor {
    project_path: AbsDirPath,
    cache_dir: AbsDirPath,
    cache_key: CacheKey,
    vcs: GitVcs,
    indexer: Arc<dyn Indexer>,
    /// Borrowed, never closed by the actor (spec.md §9 / SPEC_FULL.md §10.5).
    _embedder: Arc<dyn Embedder>,

    current_branch: StdMutex<String>,
    is_indexing: AtomicBool,
    phase: AtomicU8,
    files_indexed: AtomicU64,
    chunks_count: AtomicU64,
    registered_at: Timestamp,
    last_indexed_at: AtomicI64,

    progress_subs: StdRwLock<std::collections::HashMap<String, flume::Sender<IndexProgress>>>,

    file_watcher: FileWatcher,
    branch_watcher: BranchWatcher,

    event_tx: mpsc::UnboundedSender<ActorEvent>,
    event_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<ActorEvent>>>,
    event_task: AsyncMutex<Option<JoinHandle<()>>>,

    cancel_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Actor {
    /// Validate `project_path`, resolve its cache location, and construct
    /// (but do not yet start) its branch and file watchers. Fails if the
    /// path is invalid or either watcher cannot be constructed; the only
    /// watcher with a background resource at this point is the branch
    /// watcher (constructed last), so no explicit teardown is needed on
    /// failure (spec.md §4.9: "partial resources are released before
    /// returning the error").
    #[instrument(name = "Actor::new", skip(vcs, indexer, embedder))]
    pub async fn new(
        project_path: AbsDirPath,
        vcs: GitVcs,
        cache_root: AbsDirPath,
        indexer: Arc<dyn Indexer>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        if !fs::is_dir(project_path.as_std_path()).await {
            bail!("project path does not exist or is not a directory: {project_path:?}");
        }

        let cache_dir = ensure_cache_location(&vcs, &project_path, &cache_root)
            .await
            .context("ensure cache location")?;
        let settings = Settings::load_or_create(&vcs, &project_path, &cache_root)
            .await
            .context("load settings")?;
        let cache_key = CacheKey::from(settings.cache_key);

        let file_watcher = FileWatcher::new(
            vec![project_path.clone()],
            DEFAULT_MONITORED_EXTENSIONS.iter().copied(),
        )
        .await
        .context("construct file watcher")?;

        let current_branch = vcs.current_branch(&project_path).await;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let branch_watcher = {
            let tx = event_tx.clone();
            BranchWatcher::new(
                vcs,
                project_path.clone(),
                Some(move |old: String, new: String| {
                    let _ = tx.send(ActorEvent::BranchSwitch(old, new));
                }),
            )
            .await
            .context("construct branch watcher")?
        };

        let (cancel_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            project_path,
            cache_dir,
            cache_key,
            vcs,
            indexer,
            _embedder: embedder,
            current_branch: StdMutex::new(current_branch),
            is_indexing: AtomicBool::new(false),
            phase: AtomicU8::new(Phase::Unspecified as u8),
            files_indexed: AtomicU64::new(0),
            chunks_count: AtomicU64::new(0),
            registered_at: Timestamp::now(),
            last_indexed_at: AtomicI64::new(Timestamp::UNIX_EPOCH.as_second()),
            progress_subs: StdRwLock::new(std::collections::HashMap::new()),
            file_watcher,
            branch_watcher,
            event_tx,
            event_rx: AsyncMutex::new(Some(event_rx)),
            event_task: AsyncMutex::new(None),
            cancel_tx,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn project_path(&self) -> &AbsDirPath {
        &self.project_path
    }

    /// Launch the file watcher (the branch watcher is already running since
    /// construction) and the actor's event loop. Non-blocking.
    #[instrument(name = "Actor::start", skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut rx = {
            let mut guard = self.event_rx.lock().await;
            guard.take().ok_or_else(|| eyre!("actor already started"))?
        };

        let tx = self.event_tx.clone();
        self.file_watcher
            .start(self.cancel_tx.subscribe(), move |batch| {
                let _ = tx.send(ActorEvent::FileBatch(batch));
            })
            .await
            .context("start file watcher")?;

        let this = self.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            None => break,
                            Some(ActorEvent::BranchSwitch(old, new)) => {
                                this.handle_branch_switch(old, new).await;
                            }
                            Some(ActorEvent::FileBatch(paths)) => {
                                this.handle_file_changes(paths).await;
                            }
                        }
                    }
                }
            }
        });

        *self.event_task.lock().await = Some(task);
        Ok(())
    }

    /// Signal shutdown, close both watchers, wait for the event loop.
    /// Idempotent.
    #[instrument(name = "Actor::stop", skip(self))]
    pub async fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        self.file_watcher.stop().await;
        self.branch_watcher.close().await;
        if let Some(task) = self.event_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Drive a full index through the external indexer. At most one
    /// indexing operation runs at a time; concurrent callers get
    /// [`ALREADY_INDEXING`].
    pub async fn index(&self) -> Result<IndexProgress> {
        self.run_index(&[]).await
    }

    pub fn subscribe_progress(&self, id: impl Into<String>) -> flume::Receiver<IndexProgress> {
        let (tx, rx) = flume::bounded(PROGRESS_CHANNEL_CAPACITY);
        self.progress_subs
            .write()
            .expect("progress_subs poisoned")
            .insert(id.into(), tx);
        rx
    }

    /// Idempotent.
    pub fn unsubscribe_progress(&self, id: &str) {
        self.progress_subs
            .write()
            .expect("progress_subs poisoned")
            .remove(id);
    }

    /// Lock-free snapshot of the actor's atomic status fields.
    pub fn get_status(&self) -> ProjectStatus {
        ProjectStatus {
            path: self.project_path.as_str_lossy().into_owned(),
            cache_key: self.cache_key.as_str().to_string(),
            current_branch: self.current_branch(),
            files_indexed: self.files_indexed.load(Ordering::Acquire),
            chunks_count: self.chunks_count.load(Ordering::Acquire),
            registered_at: self.registered_at,
            last_indexed_at: Timestamp::from_second(self.last_indexed_at.load(Ordering::Acquire))
                .unwrap_or(Timestamp::UNIX_EPOCH),
            is_indexing: self.is_indexing.load(Ordering::Acquire),
            current_phase: Phase::from_u8(self.phase.load(Ordering::Acquire)),
        }
    }

    fn current_branch(&self) -> String {
        self.current_branch.lock().expect("current_branch poisoned").clone()
    }

    fn set_current_branch(&self, branch: String) {
        *self.current_branch.lock().expect("current_branch poisoned") = branch;
    }

    fn publish(&self, progress: IndexProgress) {
        let subs = self.progress_subs.read().expect("progress_subs poisoned");
        for tx in subs.values() {
            let _ = tx.try_send(progress.clone());
        }
    }

    /// `handle_branch_switch(old, new)`: pause the file watcher for the
    /// duration of a full re-index, guaranteed to resume on every exit path
    /// (including indexer failure) via the `ResumeGuard` destructor.
    #[instrument(name = "Actor::handle_branch_switch", skip(self))]
    async fn handle_branch_switch(&self, old: String, new: String) {
        info!(old = %old, new = %new, "branch switch detected");
        self.set_current_branch(new);

        self.file_watcher.pause();
        struct ResumeGuard<'a>(&'a FileWatcher);
        impl Drop for ResumeGuard<'_> {
            fn drop(&mut self) {
                self.0.resume();
            }
        }
        let _resume_guard = ResumeGuard(&self.file_watcher);

        match self.run_index(&[]).await {
            Ok(_) => info!("branch switch re-index complete"),
            Err(err) if err.to_string() == ALREADY_INDEXING => {
                warn!("branch switch deferred: an index was already running");
            }
            Err(err) => warn!(error = ?err, "branch switch re-index failed"),
        }
    }

    /// `handle_file_changes(paths)`: drop the batch if already indexing
    /// (the debouncer will fire again on the next change).
    #[instrument(name = "Actor::handle_file_changes", skip(self, paths), fields(count = paths.len()))]
    async fn handle_file_changes(&self, paths: Vec<std::path::PathBuf>) {
        if self.is_indexing.load(Ordering::Acquire) {
            debug!("file batch arrived while indexing, dropping");
            return;
        }

        let hinted: Vec<AbsFilePath> = paths
            .into_iter()
            .filter_map(|p| AbsFilePath::try_from(p).ok())
            .collect();

        match self.run_index(&hinted).await {
            Ok(_) => {}
            Err(err) if err.to_string() == ALREADY_INDEXING => {
                debug!("file batch dropped: an index was already running");
            }
            Err(err) => warn!(error = ?err, "file-change index failed"),
        }
    }

    async fn run_index(&self, hinted: &[AbsFilePath]) -> Result<IndexProgress> {
        if self
            .is_indexing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            bail!(ALREADY_INDEXING);
        }
        self.phase.store(Phase::Indexing as u8, Ordering::Release);

        let branch = self.current_branch();
        let outcome = self.indexer.index(&self.project_path, hinted).await;

        let result = match outcome {
            Ok(stats) => {
                self.apply_index_result(&branch, stats).await;
                let progress = IndexProgress {
                    phase: Phase::Complete,
                    files_total: stats.files_total,
                    files_processed: stats.files_processed,
                    chunks_generated: stats.chunks_generated,
                    current_file: None,
                    message: "index complete".to_string(),
                };
                self.phase.store(Phase::Complete as u8, Ordering::Release);
                self.publish(progress.clone());
                Ok(progress)
            }
            Err(err) => Err(err),
        };

        self.phase.store(Phase::Unspecified as u8, Ordering::Release);
        self.is_indexing.store(false, Ordering::Release);
        result
    }

    async fn apply_index_result(&self, branch: &str, stats: IndexStats) {
        self.files_indexed.store(stats.files_processed, Ordering::Release);
        self.chunks_count.store(stats.chunks_generated, Ordering::Release);
        self.last_indexed_at.store(Timestamp::now().as_second(), Ordering::Release);

        let size_mb = match branch_artifact_size_mb(&self.cache_dir, branch).await {
            Ok(size_mb) => size_mb,
            Err(err) => {
                warn!(error = ?err, branch, "unable to stat branch artifact size");
                0.0
            }
        };

        let mut metadata = match CacheMetadata::load(&self.cache_dir).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = ?err, "unable to load cache metadata, skipping stats update");
                return;
            }
        };
        metadata.update_branch_stats(branch, size_mb, stats.chunks_generated);
        if let Err(err) = metadata.save(&self.cache_dir).await {
            warn!(error = ?err, "unable to save cache metadata");
        }
    }
}
