//! Projects Registry: the durable set of registered project paths
//! (spec.md §4.10), persisted at `<cortexDir>/projects.json`.

use std::collections::BTreeMap;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::cache::identity::CacheKey;
use crate::fs;
use crate::path::{AbsDirPath, TryJoinWith};
use crate::vcs::GitVcs;

const PROJECTS_FILE_NAME: &str = "projects.json";

/// A single registered project (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisteredProject {
    pub path: String,
    pub cache_key: String,
    pub registered_at: Timestamp,
    pub last_indexed_at: Timestamp,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<RegisteredProject>,
}

/// Durable, mutex-guarded registry of known project paths.
///
/// Every mutation is persisted atomically (write-temp-then-rename) before
/// it is considered committed; a persistence failure rolls back the
/// in-memory change rather than leaving torn state visible to readers
/// (spec.md §7 "Concurrency" / §9 "Registry atomicity").
pub struct Registry {
    cortex_dir: AbsDirPath,
    projects: RwLock<BTreeMap<String, RegisteredProject>>,
}

impl Registry {
    /// Load the registry from `<cortex_dir>/projects.json`, creating an
    /// empty one if the file is absent or unparseable.
    #[instrument(name = "Registry::load", skip(cortex_dir))]
    pub async fn load(cortex_dir: AbsDirPath) -> Result<Self> {
        let path = projects_path(&cortex_dir)?;
        let file = match fs::read_buffered_utf8(&path).await {
            Ok(Some(content)) => match serde_json::from_str::<ProjectsFile>(&content) {
                Ok(file) => file,
                Err(err) => {
                    warn!(?path, error = ?err, "unable to parse projects.json, starting fresh");
                    ProjectsFile::default()
                }
            },
            Ok(None) => ProjectsFile::default(),
            Err(err) => {
                warn!(?path, error = ?err, "unable to read projects.json, starting fresh");
                ProjectsFile::default()
            }
        };

        let projects = file.projects.into_iter().map(|p| (p.path.clone(), p)).collect();
        Ok(Self {
            cortex_dir,
            projects: RwLock::new(projects),
        })
    }

    /// Register `project_path`, requiring it to be absolute and an
    /// existing directory. Computes the project's cache key via VCS
    /// *outside* any lock (slow). Idempotent: returns the existing entry
    /// if already registered. Rolls back the in-memory insertion if the
    /// persisted write fails.
    #[instrument(name = "Registry::register", skip(self, vcs))]
    pub async fn register(&self, vcs: &GitVcs, project_path: &AbsDirPath) -> Result<RegisteredProject> {
        if !fs::is_dir(project_path.as_std_path()).await {
            bail!("project path does not exist or is not a directory: {project_path:?}");
        }
        let path_str = project_path.as_str_lossy().into_owned();

        if let Some(existing) = self.projects.read().await.get(&path_str) {
            return Ok(existing.clone());
        }

        let key = CacheKey::derive(vcs, project_path).await;
        let entry = RegisteredProject {
            path: path_str.clone(),
            cache_key: key.as_str().to_string(),
            registered_at: Timestamp::now(),
            last_indexed_at: Timestamp::UNIX_EPOCH,
        };

        let mut projects = self.projects.write().await;
        if let Some(existing) = projects.get(&path_str) {
            return Ok(existing.clone());
        }
        projects.insert(path_str.clone(), entry.clone());
        if let Err(err) = self.persist(&projects).await {
            projects.remove(&path_str);
            return Err(err).context("persist registry after register");
        }

        Ok(entry)
    }

    /// Remove `project_path` from the registry. Absent path is a no-op.
    #[instrument(name = "Registry::unregister", skip(self))]
    pub async fn unregister(&self, project_path: &AbsDirPath) -> Result<()> {
        let path_str = project_path.as_str_lossy().into_owned();
        let mut projects = self.projects.write().await;
        let removed = projects.remove(&path_str);
        if removed.is_none() {
            return Ok(());
        }
        if let Err(err) = self.persist(&projects).await {
            if let Some(entry) = removed {
                projects.insert(path_str, entry);
            }
            return Err(err).context("persist registry after unregister");
        }
        Ok(())
    }

    /// A deep copy of the entry for `project_path`, if registered.
    pub async fn get(&self, project_path: &AbsDirPath) -> Option<RegisteredProject> {
        let path_str = project_path.as_str_lossy();
        self.projects.read().await.get(path_str.as_ref()).cloned()
    }

    /// A deep copy of every registered project.
    pub async fn list(&self) -> Vec<RegisteredProject> {
        self.projects.read().await.values().cloned().collect()
    }

    /// Update `last_indexed_at` for a registered project. Errors if the
    /// path is absent.
    #[instrument(name = "Registry::update_last_indexed", skip(self))]
    pub async fn update_last_indexed(&self, project_path: &AbsDirPath, at: Timestamp) -> Result<()> {
        let path_str = project_path.as_str_lossy().into_owned();
        let mut projects = self.projects.write().await;
        let entry = projects
            .get_mut(&path_str)
            .ok_or_else(|| color_eyre::eyre::eyre!("project not registered: {path_str}"))?;
        let previous = entry.last_indexed_at;
        entry.last_indexed_at = at;
        if let Err(err) = self.persist(&projects).await {
            if let Some(entry) = projects.get_mut(&path_str) {
                entry.last_indexed_at = previous;
            }
            return Err(err).context("persist registry after update_last_indexed");
        }
        Ok(())
    }

    /// Update `cache_key` for a registered project. Errors if the path is
    /// absent.
    #[instrument(name = "Registry::update_cache_key", skip(self))]
    pub async fn update_cache_key(&self, project_path: &AbsDirPath, key: &CacheKey) -> Result<()> {
        let path_str = project_path.as_str_lossy().into_owned();
        let mut projects = self.projects.write().await;
        let entry = projects
            .get_mut(&path_str)
            .ok_or_else(|| color_eyre::eyre::eyre!("project not registered: {path_str}"))?;
        let previous = entry.cache_key.clone();
        entry.cache_key = key.as_str().to_string();
        if let Err(err) = self.persist(&projects).await {
            if let Some(entry) = projects.get_mut(&path_str) {
                entry.cache_key = previous;
            }
            return Err(err).context("persist registry after update_cache_key");
        }
        Ok(())
    }

    async fn persist(&self, projects: &BTreeMap<String, RegisteredProject>) -> Result<()> {
        let path = projects_path(&self.cortex_dir)?;
        let file = ProjectsFile {
            projects: projects.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file).context("encode projects.json")?;
        fs::write_atomic(&path, content).await.context("write projects.json")
    }
}

fn projects_path(cortex_dir: &AbsDirPath) -> Result<crate::path::AbsFilePath> {
    cortex_dir.try_join_file(PROJECTS_FILE_NAME).context("build projects.json path")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn register_creates_entry() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path).await.expect("load");
        let vcs = GitVcs;
        let entry = registry.register(&vcs, &project_path).await.expect("register");

        assert_eq!(entry.path, project_path.as_str_lossy());
        assert_eq!(entry.last_indexed_at, Timestamp::UNIX_EPOCH);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn register_is_idempotent() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path).await.expect("load");
        let vcs = GitVcs;
        let first = registry.register(&vcs, &project_path).await.expect("register");
        let second = registry.register(&vcs, &project_path).await.expect("register again");

        assert_eq!(first.registered_at, second.registered_at);
        assert_eq!(registry.list().await.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn unregister_absent_path_is_noop() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path).await.expect("load");
        registry.unregister(&project_path).await.expect("unregister");
        assert!(registry.list().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn register_then_unregister_removes_entry() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path).await.expect("load");
        let vcs = GitVcs;
        registry.register(&vcs, &project_path).await.expect("register");
        registry.unregister(&project_path).await.expect("unregister");
        assert!(registry.get(&project_path).await.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn update_last_indexed_errors_when_absent() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path).await.expect("load");
        let err = registry
            .update_last_indexed(&project_path, Timestamp::now())
            .await
            .expect_err("should error");
        assert!(err.to_string().contains("not registered"));
    }

    #[test_log::test(tokio::test)]
    async fn persisted_registry_survives_reload() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path.clone()).await.expect("load");
        let vcs = GitVcs;
        registry.register(&vcs, &project_path).await.expect("register");

        let reloaded = Registry::load(cortex_path).await.expect("reload");
        assert_eq!(reloaded.list().await.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn list_and_get_return_copies() {
        let cortex_dir = tempfile::tempdir().expect("tempdir");
        let project = tempfile::tempdir().expect("tempdir");
        let cortex_path = AbsDirPath::try_from(cortex_dir.path().to_path_buf()).unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let registry = Registry::load(cortex_path).await.expect("load");
        let vcs = GitVcs;
        registry.register(&vcs, &project_path).await.expect("register");

        let mut copy = registry.get(&project_path).await.expect("get");
        copy.cache_key = "mutated".to_string();

        let reread = registry.get(&project_path).await.expect("get again");
        assert_ne!(reread.cache_key, "mutated");
    }
}
