//! Per-project durable identity file (spec.md §3/§4.3).

use color_eyre::Result;
use color_eyre::eyre::Context;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::cache::identity::CacheKey;
use crate::fs;
use crate::path::{AbsDirPath, TryJoinWith};
use crate::vcs::GitVcs;

/// Schema version written by this revision.
pub const SCHEMA_VERSION: &str = "2.0";


/// A project's durable identity: which cache key and location it currently
/// resolves to, plus advisory copies of the VCS state used to derive them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub cache_key: String,
    pub cache_location: String,
    pub remote_url: String,
    pub worktree_path: String,
    pub last_indexed: Timestamp,
    pub schema_version: String,
}

impl Settings {
    fn synthesize(cache_key: &CacheKey, cache_location: &AbsDirPath, remote_url: String, worktree_path: String) -> Self {
        Self {
            cache_key: cache_key.as_str().to_string(),
            cache_location: cache_location.as_str_lossy().into_owned(),
            remote_url,
            worktree_path,
            last_indexed: Timestamp::UNIX_EPOCH,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Read-parse-return the settings file for `project_path`; if it's
    /// absent or unparseable, synthesize fresh settings from current VCS
    /// state and `cache_root` and return them **unsaved** (caller decides
    /// whether/when to persist, typically via `EnsureCacheLocation`).
    #[instrument(name = "Settings::load_or_create", skip(vcs))]
    pub async fn load_or_create(
        vcs: &GitVcs,
        project_path: &AbsDirPath,
        cache_root: &AbsDirPath,
    ) -> Result<Self> {
        let path = settings_path(project_path)?;

        match fs::read_buffered_utf8(&path).await {
            Ok(Some(content)) => match serde_json::from_str(&content) {
                Ok(settings) => return Ok(settings),
                Err(err) => warn!(?path, error = ?err, "unable to parse settings, recreating"),
            },
            Ok(None) => {}
            Err(err) => warn!(?path, error = ?err, "unable to read settings, recreating"),
        }

        let remote_url = vcs.remote_url(project_path).await;
        let worktree_path = vcs.worktree_root(project_path).await;
        let key = CacheKey::from_parts(&remote_url, &worktree_path);
        let cache_location = cache_root.try_join_dir(key.as_str())?;
        Ok(Self::synthesize(&key, &cache_location, remote_url, worktree_path))
    }

    /// Atomically persist settings to `<project>/.cortex/settings.local.json`,
    /// creating the `.cortex` directory if necessary.
    #[instrument(name = "Settings::save", skip(self))]
    pub async fn save(&self, project_path: &AbsDirPath) -> Result<()> {
        let path = settings_path(project_path)?;
        let content = serde_json::to_string_pretty(self).context("encode settings")?;
        fs::write_atomic(&path, content)
            .await
            .context("write settings")
    }
}

fn settings_path(project_path: &AbsDirPath) -> Result<crate::path::AbsFilePath> {
    project_path
        .try_join_combined([".cortex"], "settings.local.json")
        .context("build settings path")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn load_or_create_synthesizes_when_absent() {
        let project = tempfile::tempdir().expect("tempdir");
        let cache_root = tempfile::tempdir().expect("tempdir");
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();
        let cache_root_path = AbsDirPath::try_from(cache_root.path().to_path_buf()).unwrap();

        let vcs = GitVcs;
        let settings = Settings::load_or_create(&vcs, &project_path, &cache_root_path)
            .await
            .expect("load_or_create");

        assert_eq!(settings.schema_version, SCHEMA_VERSION);
        assert_eq!(settings.last_indexed, Timestamp::UNIX_EPOCH);
        assert!(settings.cache_key.contains('-'));
    }

    #[test_log::test(tokio::test)]
    async fn save_then_load_round_trips() {
        let project = tempfile::tempdir().expect("tempdir");
        let cache_root = tempfile::tempdir().expect("tempdir");
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();
        let cache_root_path = AbsDirPath::try_from(cache_root.path().to_path_buf()).unwrap();

        let vcs = GitVcs;
        let mut settings = Settings::load_or_create(&vcs, &project_path, &cache_root_path)
            .await
            .expect("load_or_create");
        settings.cache_key = "abcd1234-deadbeef".to_string();
        settings.save(&project_path).await.expect("save");

        let reloaded = Settings::load_or_create(&vcs, &project_path, &cache_root_path)
            .await
            .expect("load_or_create again");
        assert_eq!(reloaded.cache_key, "abcd1234-deadbeef");
    }

    #[test_log::test(tokio::test)]
    async fn load_or_create_recreates_on_parse_failure() {
        let project = tempfile::tempdir().expect("tempdir");
        let cache_root = tempfile::tempdir().expect("tempdir");
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();
        let cache_root_path = AbsDirPath::try_from(cache_root.path().to_path_buf()).unwrap();

        let path = settings_path(&project_path).unwrap();
        fs::write_atomic(&path, b"not json").await.expect("write garbage");

        let vcs = GitVcs;
        let settings = Settings::load_or_create(&vcs, &project_path, &cache_root_path)
            .await
            .expect("load_or_create");
        assert_eq!(settings.schema_version, SCHEMA_VERSION);
    }
}
