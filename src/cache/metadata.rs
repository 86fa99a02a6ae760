//! Per-project catalogue of cached branches: sizes, last-access, and the
//! immortal flag (spec.md §3/§4.5).

use std::collections::BTreeMap;

use color_eyre::Result;
use color_eyre::eyre::Context;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace, warn};

use crate::fs;
use crate::path::{AbsDirPath, TryJoinWith};

/// Branch names that are always immortal, regardless of policy.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// File name of the metadata file within a cache directory.
const METADATA_FILE_NAME: &str = "metadata.json";

/// Schema version written by this revision.
const METADATA_VERSION: &str = "1.0.0";

/// Per-branch cache accounting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchMetadata {
    pub last_accessed: Timestamp,
    pub size_mb: f64,
    pub chunk_count: u64,
    pub is_immortal: bool,
}

/// Per-project catalogue of branches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: String,
    pub project_key: String,
    #[serde(default, deserialize_with = "deserialize_branches")]
    pub branches: BTreeMap<String, BranchMetadata>,
    pub total_size_mb: f64,
    pub last_eviction: Timestamp,
}

/// A `null` or missing `branches` mapping is treated as empty.
fn deserialize_branches<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, BranchMetadata>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, BranchMetadata>>::deserialize(deserializer)?.unwrap_or_default())
}

impl CacheMetadata {
    /// A fresh, empty metadata instance for the given cache directory.
    pub fn empty(cache_dir: &AbsDirPath) -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            project_key: project_key_of(cache_dir),
            branches: BTreeMap::new(),
            total_size_mb: 0.0,
            last_eviction: Timestamp::UNIX_EPOCH,
        }
    }

    /// Load metadata from `<cacheDir>/metadata.json`.
    ///
    /// A missing file, an unreadable file, or unparseable JSON all yield a
    /// fresh empty metadata rather than an error. This function only fails
    /// if the filesystem reports an I/O error other than not-found.
    #[instrument(name = "CacheMetadata::load")]
    pub async fn load(cache_dir: &AbsDirPath) -> Result<Self> {
        let path = cache_dir
            .try_join_file(METADATA_FILE_NAME)
            .context("build metadata path")?;

        let content = match fs::read_buffered_utf8(&path).await {
            Ok(Some(content)) => content,
            Ok(None) => return Ok(Self::empty(cache_dir)),
            Err(err) => {
                warn!(?path, error = ?err, "unable to read cache metadata, starting fresh");
                return Ok(Self::empty(cache_dir));
            }
        };

        match serde_json::from_str(&content) {
            Ok(metadata) => Ok(metadata),
            Err(err) => {
                warn!(?path, error = ?err, "unable to parse cache metadata, starting fresh");
                Ok(Self::empty(cache_dir))
            }
        }
    }

    /// Atomically persist metadata to `<cacheDir>/metadata.json`.
    #[instrument(name = "CacheMetadata::save", skip(self))]
    pub async fn save(&self, cache_dir: &AbsDirPath) -> Result<()> {
        let path = cache_dir
            .try_join_file(METADATA_FILE_NAME)
            .context("build metadata path")?;
        let content = serde_json::to_string_pretty(self).context("encode cache metadata")?;
        fs::write_atomic(&path, content)
            .await
            .context("write cache metadata")
    }

    /// Create-or-update a branch's stats; sets `last_accessed = now`;
    /// forces `is_immortal = true` for protected branch names (never
    /// cleared); recomputes `total_size_mb`.
    pub fn update_branch_stats(&mut self, branch: &str, size_mb: f64, chunk_count: u64) {
        let is_protected = PROTECTED_BRANCHES.contains(&branch);
        let entry = self
            .branches
            .entry(branch.to_string())
            .or_insert_with(|| BranchMetadata {
                last_accessed: Timestamp::now(),
                size_mb: 0.0,
                chunk_count: 0,
                is_immortal: is_protected,
            });
        entry.last_accessed = Timestamp::now();
        entry.size_mb = size_mb;
        entry.chunk_count = chunk_count;
        if is_protected {
            entry.is_immortal = true;
        }
        self.recompute_total();
    }

    /// Delete the entry if present; recompute `total_size_mb`. Removing an
    /// absent branch is a no-op.
    pub fn remove_branch(&mut self, branch: &str) {
        if self.branches.remove(branch).is_some() {
            self.recompute_total();
        }
    }

    /// The entry for `branch`, if present.
    pub fn branch_stats(&self, branch: &str) -> Option<&BranchMetadata> {
        self.branches.get(branch)
    }

    fn recompute_total(&mut self) {
        self.total_size_mb = self.branches.values().map(|b| b.size_mb).sum();
        trace!(total_size_mb = self.total_size_mb, "recomputed cache total size");
    }
}

/// The size, in megabytes (bytes / 1024²), of a branch's artifact file.
/// Returns `0.0` if the file is missing.
#[instrument(name = "branch_artifact_size_mb")]
pub async fn branch_artifact_size_mb(cache_dir: &AbsDirPath, branch: &str) -> Result<f64> {
    let path = cache_dir
        .try_join_dir("branches")
        .context("build branches dir path")?
        .try_join_file(format!("{branch}.artifact"))
        .context("build artifact path")?;

    Ok(match fs::metadata(path.as_std_path()).await? {
        Some(metadata) => metadata.len() as f64 / (1024.0 * 1024.0),
        None => 0.0,
    })
}

fn project_key_of(cache_dir: &AbsDirPath) -> String {
    cache_dir
        .file_name_str_lossy()
        .map(|s| s.into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tmp_cache_dir() -> (tempfile::TempDir, AbsDirPath) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cafe1234-deadbeef");
        let typed = AbsDirPath::try_from(path).expect("typed path");
        (dir, typed)
    }

    #[test_log::test(tokio::test)]
    async fn load_missing_file_is_empty() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let metadata = CacheMetadata::load(&cache_dir).await.expect("load");
        assert_eq!(metadata.version, METADATA_VERSION);
        assert!(metadata.branches.is_empty());
        assert_eq!(metadata.total_size_mb, 0.0);
    }

    #[test_log::test(tokio::test)]
    async fn load_unparseable_file_is_empty() {
        let (_dir, cache_dir) = tmp_cache_dir();
        fs::create_dir_all(&cache_dir).await.expect("mkdir");
        let path = cache_dir.try_join_file(METADATA_FILE_NAME).unwrap();
        fs::write_atomic(&path, b"not json").await.expect("write");

        let metadata = CacheMetadata::load(&cache_dir).await.expect("load");
        assert!(metadata.branches.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn save_then_load_round_trips() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("main", 12.5, 100);
        metadata.save(&cache_dir).await.expect("save");

        let loaded = CacheMetadata::load(&cache_dir).await.expect("load");
        assert_eq!(loaded.total_size_mb, 12.5);
        assert!(loaded.branches["main"].is_immortal);
    }

    #[test_log::test]
    fn update_branch_stats_forces_immortal_for_protected_names() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("main", 10.0, 5);
        metadata.update_branch_stats("master", 10.0, 5);
        metadata.update_branch_stats("feature/x", 5.0, 2);

        assert!(metadata.branches["main"].is_immortal);
        assert!(metadata.branches["master"].is_immortal);
        assert!(!metadata.branches["feature/x"].is_immortal);
        assert_eq!(metadata.total_size_mb, 25.0);
    }

    #[test_log::test]
    fn remove_branch_recomputes_total() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("feature/x", 5.0, 2);
        metadata.update_branch_stats("feature/y", 3.0, 1);
        metadata.remove_branch("feature/x");

        assert!(metadata.branch_stats("feature/x").is_none());
        assert_eq!(metadata.total_size_mb, 3.0);
    }

    #[test_log::test]
    fn remove_absent_branch_is_noop() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("feature/x", 5.0, 2);
        metadata.remove_branch("does-not-exist");
        assert_eq!(metadata.total_size_mb, 5.0);
    }

    #[test_log::test(tokio::test)]
    async fn branch_artifact_size_missing_file_is_zero() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let size = branch_artifact_size_mb(&cache_dir, "main").await.expect("size");
        assert_eq!(size, 0.0);
    }

    #[test_log::test(tokio::test)]
    async fn branch_artifact_size_reports_file_size() {
        let (_dir, cache_dir) = tmp_cache_dir();
        let branches_dir = cache_dir.try_join_dir("branches").unwrap();
        fs::create_dir_all(&branches_dir).await.expect("mkdir");
        let artifact = branches_dir.try_join_file("main.artifact").unwrap();
        fs::write(&artifact, vec![0u8; 2 * 1024 * 1024])
            .await
            .expect("write artifact");

        let size = branch_artifact_size_mb(&cache_dir, "main").await.expect("size");
        assert_eq!(size, 2.0);
    }
}
