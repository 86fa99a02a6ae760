//! File Watcher: recursive, extension-filtered, debounced, batched file
//! change notification with pause/resume (spec.md §4.8).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use notify::event::CreateKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{instrument, trace, warn};

use crate::fs;
use crate::path::AbsDirPath;

/// Default debounce window, overridable via [`FileWatcher::with_debounce`]
/// (spec.md §4.8).
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

enum Control {
    Pause,
    Resume,
    Stop,
}

struct Running {
    watcher: std::sync::Arc<StdMutex<Option<RecommendedWatcher>>>,
    control_tx: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

/// Recursively watches a set of root directories for create/write/remove/
/// rename events on paths with a monitored extension, debouncing them into
/// deduplicated, ordered batches.
pub struct FileWatcher {
    roots: Vec<AbsDirPath>,
    extensions: HashSet<String>,
    debounce: Duration,
    running: Mutex<Option<Running>>,
}

impl FileWatcher {
    /// Construct a watcher over `roots`, filtering to `extensions` (each
    /// without a leading `.`, e.g. `"rs"`). Fails if any root does not exist
    /// (spec.md §4.8: "Non-existent root paths cause construction failure").
    #[instrument(name = "FileWatcher::new", skip(extensions))]
    pub async fn new(
        roots: Vec<AbsDirPath>,
        extensions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        for root in &roots {
            if !fs::is_dir(root.as_std_path()).await {
                bail!("file watcher root does not exist: {root:?}");
            }
        }

        Ok(Self {
            roots,
            extensions: extensions.into_iter().map(Into::into).collect(),
            debounce: DEFAULT_DEBOUNCE,
            running: Mutex::new(None),
        })
    }

    /// Override the default 500 ms debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Begin recursive watching. `cancel` firing is equivalent to [`Self::stop`].
    /// `on_batch` receives a deduplicated, ordered batch of changed paths
    /// whenever the debounce window elapses with accumulated events.
    #[instrument(name = "FileWatcher::start", skip(self, cancel, on_batch))]
    pub async fn start(
        &self,
        cancel: watch::Receiver<bool>,
        on_batch: impl Fn(Vec<PathBuf>) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            bail!("file watcher already started");
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();

        let watcher_handle: std::sync::Arc<StdMutex<Option<RecommendedWatcher>>> =
            std::sync::Arc::new(StdMutex::new(None));
        let watcher_handle_cb = watcher_handle.clone();
        let extensions = self.extensions.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = ?err, "file watcher observation error");
                    return;
                }
            };

            for path in &event.paths {
                if matches!(event.kind, EventKind::Create(CreateKind::Folder)) && path.is_dir() {
                    if let Some(w) = watcher_handle_cb.lock().expect("watcher mutex poisoned").as_mut() {
                        let _ = w.watch(path, RecursiveMode::Recursive);
                    }
                }

                if should_pass(path, &event.kind, &extensions) {
                    let _ = event_tx.send(path.clone());
                }
            }
        })
        .context("create file watcher")?;

        for root in &self.roots {
            watcher
                .watch(root.as_std_path(), RecursiveMode::Recursive)
                .with_context(|| format!("watch root {root:?}"))?;
        }
        *watcher_handle.lock().expect("watcher mutex poisoned") = Some(watcher);

        let debounce = self.debounce;
        let on_batch = std::sync::Arc::new(on_batch);
        let task = tokio::spawn(run_batcher(event_rx, control_rx, cancel, debounce, on_batch));

        *guard = Some(Running {
            watcher: watcher_handle,
            control_tx,
            task,
        });
        Ok(())
    }

    /// Stop delivering flushes but keep accumulating (and deduplicating)
    /// events. No-op if not started.
    pub fn pause(&self) {
        self.send_control(Control::Pause);
    }

    /// Resume delivery; flushes immediately if events accumulated during the
    /// pause. No-op if not started.
    pub fn resume(&self) {
        self.send_control(Control::Resume);
    }

    fn send_control(&self, control: Control) {
        if let Ok(guard) = self.running.try_lock() {
            if let Some(running) = guard.as_ref() {
                let _ = running.control_tx.send(control);
            }
        }
    }

    /// Release all watches and stop the background task. Idempotent and
    /// safe under concurrent callers.
    #[instrument(name = "FileWatcher::stop", skip(self))]
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.control_tx.send(Control::Stop);
            let _ = running.task.await;
            *running.watcher.lock().expect("watcher mutex poisoned") = None;
        }
    }
}

async fn run_batcher(
    mut event_rx: mpsc::UnboundedReceiver<PathBuf>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut cancel: watch::Receiver<bool>,
    debounce: Duration,
    on_batch: std::sync::Arc<dyn Fn(Vec<PathBuf>) + Send + Sync>,
) {
    let mut pending: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut paused = false;
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
            maybe_control = control_rx.recv() => {
                match maybe_control {
                    None | Some(Control::Stop) => break,
                    Some(Control::Pause) => paused = true,
                    Some(Control::Resume) => {
                        let was_paused = paused;
                        paused = false;
                        if was_paused && !pending.is_empty() {
                            let batch = std::mem::take(&mut pending);
                            seen.clear();
                            deadline = None;
                            on_batch(batch);
                        }
                    }
                }
            }
            maybe_path = event_rx.recv() => {
                match maybe_path {
                    None => break,
                    Some(path) => {
                        if seen.insert(path.clone()) {
                            pending.push(path);
                        }
                        deadline = Some(Instant::now() + debounce);
                    }
                }
            }
            _ = sleep => {
                deadline = None;
                if !paused && !pending.is_empty() {
                    let batch = std::mem::take(&mut pending);
                    seen.clear();
                    trace!(count = batch.len(), "flushing file watcher batch");
                    on_batch(batch);
                }
            }
        }
    }
}

fn should_pass(path: &Path, kind: &EventKind, extensions: &HashSet<String>) -> bool {
    let is_directory_like =
        matches!(kind, EventKind::Create(CreateKind::Folder)) || path.is_dir();
    if is_directory_like {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.contains(ext))
}
