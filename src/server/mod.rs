//! The Server: hosts the set of per-project Actors, owns the shared
//! embedder resource and a bounded log ring, and exposes the RPC surface
//! defined in `rpc` (spec.md §4.11/§6).

pub mod rpc;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use color_eyre::Result;
use color_eyre::eyre::Context;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jiff::Timestamp;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::actor::Actor;
use crate::fs;
use crate::indexer::{Embedder, Indexer};
use crate::path::AbsDirPath;
use crate::registry::Registry;
use crate::vcs::GitVcs;

/// Default capacity of the Server's bounded log ring (spec.md §4.11:
/// "bounded circular log ring of 1000 entries").
pub const LOG_RING_CAPACITY: usize = 1000;

/// A single log line, either daemon-wide (`project` empty) or scoped to a
/// project (spec.md §6 `LogEntry`).
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub project: String,
    pub level: String,
    pub message: String,
}

/// Bounded circular buffer of the most recent `capacity` log entries, plus
/// a table of non-blocking subscriber channels (spec.md §4.11 "Log ring").
struct LogRing {
    capacity: usize,
    entries: StdMutex<VecDeque<LogEntry>>,
    subscribers: StdMutex<HashMap<String, flume::Sender<LogEntry>>>,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: StdMutex::new(VecDeque::with_capacity(capacity)),
            subscribers: StdMutex::new(HashMap::new()),
        }
    }

    /// Append an entry, evicting the oldest if full, and broadcast it to
    /// every subscriber non-blockingly (slow subscribers drop the event).
    fn push(&self, project: impl Into<String>, level: impl Into<String>, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp_ms: Timestamp::now().as_millisecond(),
            project: project.into(),
            level: level.into(),
            message: message.into(),
        };

        {
            let mut entries = self.entries.lock().expect("log ring poisoned");
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        let subscribers = self.subscribers.lock().expect("log subscribers poisoned");
        for tx in subscribers.values() {
            let _ = tx.try_send(entry.clone());
        }
    }

    /// Drain the ring in chronological (oldest-to-newest) order, optionally
    /// filtered to a single project.
    fn collect_buffered(&self, project_filter: Option<&str>) -> Vec<LogEntry> {
        self.entries
            .lock()
            .expect("log ring poisoned")
            .iter()
            .filter(|entry| project_filter.is_none_or(|p| entry.project == p))
            .cloned()
            .collect()
    }

    fn subscribe(&self, id: impl Into<String>) -> flume::Receiver<LogEntry> {
        let (tx, rx) = flume::bounded(64);
        self.subscribers
            .lock()
            .expect("log subscribers poisoned")
            .insert(id.into(), tx);
        rx
    }

    fn unsubscribe(&self, id: &str) {
        self.subscribers.lock().expect("log subscribers poisoned").remove(id);
    }

    /// Close every open subscription (spec.md §4.11 `shutdownInternal`).
    fn close_all_subscribers(&self) {
        self.subscribers.lock().expect("log subscribers poisoned").clear();
    }
}

/// Orchestrates the set of per-project Actors, keyed by absolute project
/// path (spec.md §4.11).
pub struct Server {
    pid: u32,
    started_at: Timestamp,
    socket_path: String,
    cache_root: AbsDirPath,
    vcs: GitVcs,
    indexer: std::sync::Arc<dyn Indexer>,
    embedder: std::sync::Arc<dyn Embedder>,
    registry: Registry,
    actors: DashMap<String, std::sync::Arc<Actor>>,
    logs: LogRing,
    shutdown_tx: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

/// Snapshot of daemon-level status (spec.md §6 `Daemon`).
#[derive(Clone, Debug, Serialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub started_at: i64,
    pub uptime_seconds: i64,
    pub socket_path: String,
}

impl Server {
    /// Construct a server bound to `socket_path`, with the given cache
    /// root, registry, external indexer, and shared embedder resource.
    pub fn new(
        socket_path: String,
        cache_root: AbsDirPath,
        registry: Registry,
        indexer: std::sync::Arc<dyn Indexer>,
        embedder: std::sync::Arc<dyn Embedder>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pid: std::process::id(),
            started_at: Timestamp::now(),
            socket_path,
            cache_root,
            vcs: GitVcs,
            indexer,
            embedder,
            registry,
            actors: DashMap::new(),
            logs: LogRing::new(LOG_RING_CAPACITY),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn daemon_status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: self.pid,
            started_at: self.started_at.as_second(),
            uptime_seconds: (Timestamp::now().as_second() - self.started_at.as_second()).max(0),
            socket_path: self.socket_path.clone(),
        }
    }

    /// A watch receiver that fires when `Shutdown` (RPC or signal handler)
    /// has been invoked, for `shutdown_signal` to select on.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn log(&self, project: impl Into<String>, level: impl Into<String>, message: impl Into<String>) {
        self.logs.push(project, level, message);
    }

    pub fn collect_buffered_logs(&self, project_filter: Option<&str>) -> Vec<LogEntry> {
        self.logs.collect_buffered(project_filter)
    }

    pub fn subscribe_logs(&self, id: impl Into<String>) -> flume::Receiver<LogEntry> {
        self.logs.subscribe(id)
    }

    pub fn unsubscribe_logs(&self, id: &str) {
        self.logs.unsubscribe(id);
    }

    pub async fn status_of_all_projects(&self) -> Vec<crate::actor::ProjectStatus> {
        self.actors.iter().map(|entry| entry.value().get_status()).collect()
    }

    /// Register `project_path` and return its (possibly newly constructed)
    /// Actor, started and ready to index.
    ///
    /// First-checks under a read of the map; on miss, constructs a new
    /// actor outside any lock (slow: opens watchers, touches disk), then
    /// re-checks. If another caller raced and won, the loser is
    /// immediately stopped and the winner is returned — exactly one actor
    /// per project path (spec.md §4.11 `getOrCreateActor`).
    #[instrument(name = "Server::get_or_create_actor", skip(self))]
    pub async fn get_or_create_actor(&self, project_path: &AbsDirPath) -> Result<std::sync::Arc<Actor>> {
        let key = project_path.as_str_lossy().into_owned();

        if let Some(actor) = self.actors.get(&key) {
            return Ok(actor.clone());
        }

        self.registry
            .register(&self.vcs, project_path)
            .await
            .context("register project")?;

        let candidate = Actor::new(
            project_path.clone(),
            self.vcs,
            self.cache_root.clone(),
            self.indexer.clone(),
            self.embedder.clone(),
        )
        .await
        .context("construct actor")?;
        candidate.start().await.context("start actor")?;

        match self.actors.entry(key) {
            Entry::Occupied(occupied) => {
                let winner = occupied.get().clone();
                candidate.stop().await;
                Ok(winner)
            }
            Entry::Vacant(vacant) => {
                self.log(project_path.as_str_lossy(), "INFO", "actor created");
                vacant.insert(candidate.clone());
                Ok(candidate)
            }
        }
    }

    /// Stop and remove the actor for `project_path`, if any. Idempotent.
    #[instrument(name = "Server::stop_actor", skip(self))]
    pub async fn stop_actor(&self, project_path: &AbsDirPath) {
        let key = project_path.as_str_lossy().into_owned();
        if let Some((_, actor)) = self.actors.remove(&key) {
            actor.stop().await;
        }
    }

    /// Unregister a project: stop its actor, remove it from the registry,
    /// and optionally delete its entire cache directory tree. Idempotent.
    #[instrument(name = "Server::unregister_project", skip(self))]
    pub async fn unregister_project(&self, project_path: &AbsDirPath, remove_cache: bool) -> Result<String> {
        let was_registered = self.registry.get(project_path).await.is_some();
        self.stop_actor(project_path).await;
        self.registry.unregister(project_path).await.context("unregister project")?;

        if remove_cache {
            let cache_key = crate::cache::identity::CacheKey::derive(&self.vcs, project_path).await;
            let cache_dir = crate::cache::layout::cache_path(&self.cache_root, &cache_key)?;
            if fs::exists(cache_dir.as_std_path()).await {
                fs::remove_dir_all(&cache_dir)
                    .await
                    .context("remove cache directory")?;
            }
        }

        self.log(
            project_path.as_str_lossy(),
            "INFO",
            if was_registered { "project unregistered" } else { "project was not registered" },
        );

        Ok(if was_registered {
            "project unregistered".to_string()
        } else {
            "project was not registered".to_string()
        })
    }

    /// Stop every actor, clear the actor map, close every log
    /// subscription, and signal shutdown. Safe to call from both the
    /// `Shutdown` RPC and a signal handler (spec.md §4.11
    /// `shutdownInternal`).
    #[instrument(name = "Server::shutdown_internal", skip(self))]
    pub async fn shutdown_internal(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down: stopping all actors");

        let keys: Vec<String> = self.actors.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, actor)) = self.actors.remove(&key) {
                actor.stop().await;
            }
        }

        self.logs.close_all_subscribers();
        if self.shutdown_tx.send(true).is_err() {
            warn!("shutdown signal had no receivers");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::indexer::{NullEmbedder, NullIndexer};

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

    async fn test_server() -> (Server, tempfile::TempDir, tempfile::TempDir) {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let cache_root_dir = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let cache_root = AbsDirPath::try_from(cache_root_dir.path().to_path_buf()).unwrap();
        let registry = Registry::load(cortex_path).await.expect("load registry");
        let server = Server::new(
            "127.0.0.1:0".to_string(),
            cache_root,
            registry,
            Arc::new(NullIndexer::default()),
            Arc::new(NullEmbedder),
        );
        (server, cortex_dir, cache_root_dir)
    }

    #[test_log::test(tokio::test)]
    async fn get_or_create_actor_is_idempotent() {
        let (server, _cortex, _cache) = test_server().await;
        let project = tempfile::tempdir().expect("tempdir");
        init_repo(project.path()).await;
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let first = server.get_or_create_actor(&project_path).await.expect("create");
        let second = server.get_or_create_actor(&project_path).await.expect("get again");
        assert!(Arc::ptr_eq(&first, &second));

        server.shutdown_internal().await;
    }

    #[test_log::test(tokio::test)]
    async fn unregister_unknown_project_is_idempotent() {
        let (server, _cortex, _cache) = test_server().await;
        let project = tempfile::tempdir().expect("tempdir");
        init_repo(project.path()).await;
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let message = server
            .unregister_project(&project_path, false)
            .await
            .expect("unregister");
        assert_eq!(message, "project was not registered");
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_internal_clears_actors_and_is_idempotent() {
        let (server, _cortex, _cache) = test_server().await;
        let project = tempfile::tempdir().expect("tempdir");
        init_repo(project.path()).await;
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        server.get_or_create_actor(&project_path).await.expect("create");
        assert_eq!(server.status_of_all_projects().await.len(), 1);

        server.shutdown_internal().await;
        assert_eq!(server.status_of_all_projects().await.len(), 0);

        // Second call must not panic or double-stop.
        server.shutdown_internal().await;
    }

    #[test_log::test]
    fn log_ring_evicts_oldest_when_full() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push("", "INFO", format!("message {i}"));
        }
        let buffered = ring.collect_buffered(None);
        assert_eq!(buffered.len(), 3);
        assert_eq!(buffered[0].message, "message 2");
        assert_eq!(buffered[2].message, "message 4");
    }

    #[test_log::test]
    fn log_ring_filters_by_project() {
        let ring = LogRing::new(10);
        ring.push("proj-a", "INFO", "a message");
        ring.push("proj-b", "INFO", "b message");

        let filtered = ring.collect_buffered(Some("proj-a"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].project, "proj-a");
    }
}
