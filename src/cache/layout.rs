//! Cache layout resolution and the `EnsureCacheLocation` migration
//! (spec.md §3/§4.3/§4.4).

use color_eyre::Result;
use color_eyre::eyre::Context;
use tap::Pipe;
use tracing::{instrument, warn};

use crate::cache::identity::CacheKey;
use crate::cache::settings::Settings;
use crate::fs;
use crate::path::{AbsDirPath, TryJoinWith};
use crate::vcs::GitVcs;

/// `cacheRoot / key`.
pub fn cache_path(cache_root: &AbsDirPath, key: &CacheKey) -> Result<AbsDirPath> {
    cache_root.try_join_dir(key.as_str())
}

/// Expand a leading `~/` to the user's home directory. Paths without that
/// prefix are returned unchanged.
pub async fn expand_home(path: &str) -> Result<String> {
    let Some(rest) = path.strip_prefix("~/") else {
        return Ok(path.to_string());
    };
    let home = tokio::task::spawn_blocking(homedir::my_home)
        .await
        .context("join task")?
        .context("get user home directory")?
        .ok_or_else(|| color_eyre::eyre::eyre!("user has no home directory"))?;
    Ok(home.join(rest).to_string_lossy().into_owned())
}

/// Idempotent: callable on every daemon startup for every project. Returns
/// the *current* cache path, migrating the cache tree in place if the
/// project's cache key has drifted since the last run.
#[instrument(name = "ensure_cache_location", skip(vcs))]
pub async fn ensure_cache_location(
    vcs: &GitVcs,
    project_path: &AbsDirPath,
    cache_root: &AbsDirPath,
) -> Result<AbsDirPath> {
    let mut settings = Settings::load_or_create(vcs, project_path, cache_root)
        .await
        .context("load or create settings")?;

    let remote_url = vcs.remote_url(project_path).await;
    let worktree_path = vcs.worktree_root(project_path).await;
    let current_key = CacheKey::from_parts(&remote_url, &worktree_path);
    let new_path = cache_path(cache_root, &current_key).context("build new cache path")?;

    if !settings.cache_key.is_empty() && settings.cache_key != current_key.as_str() {
        let expanded = expand_home(&settings.cache_location)
            .await
            .context("expand cache_location")?;
        let old_path = AbsDirPath::try_from(expanded).context("parse old cache path")?;

        if fs::exists(old_path.as_std_path()).await {
            match fs::rename(&old_path, &new_path).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(
                        ?old_path,
                        ?new_path,
                        error = ?err,
                        "cross-filesystem cache migration failed, starting fresh"
                    );
                    fs::create_dir_all(&new_path)
                        .await
                        .context("create fresh cache dir")?;
                }
            }
        }
    }

    settings.cache_key = current_key.as_str().to_string();
    settings.cache_location = new_path.as_str_lossy().into_owned();
    settings.remote_url = remote_url;
    settings.worktree_path = worktree_path;
    settings
        .save(project_path)
        .await
        .context("save migrated settings")?;

    new_path
        .try_join_dir("branches")
        .context("build branches dir path")?
        .pipe(|branches| fs::create_dir_all(&branches))
        .await
        .context("ensure branches dir exists")?;

    Ok(new_path)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn ensure_cache_location_creates_branches_dir() {
        let project = tempfile::tempdir().expect("tempdir");
        let cache_root_dir = tempfile::tempdir().expect("tempdir");
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();
        let cache_root = AbsDirPath::try_from(cache_root_dir.path().to_path_buf()).unwrap();

        let vcs = GitVcs;
        let new_path = ensure_cache_location(&vcs, &project_path, &cache_root)
            .await
            .expect("ensure_cache_location");

        let branches = new_path.try_join_dir("branches").unwrap();
        assert!(fs::is_dir(branches.as_std_path()).await);

        let settings = Settings::load_or_create(&vcs, &project_path, &cache_root)
            .await
            .expect("reload settings");
        assert_eq!(settings.cache_location, new_path.as_str_lossy());
    }

    #[test_log::test(tokio::test)]
    async fn ensure_cache_location_is_idempotent() {
        let project = tempfile::tempdir().expect("tempdir");
        let cache_root_dir = tempfile::tempdir().expect("tempdir");
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();
        let cache_root = AbsDirPath::try_from(cache_root_dir.path().to_path_buf()).unwrap();

        let vcs = GitVcs;
        let first = ensure_cache_location(&vcs, &project_path, &cache_root)
            .await
            .expect("first call");
        let second = ensure_cache_location(&vcs, &project_path, &cache_root)
            .await
            .expect("second call");

        assert_eq!(first.as_str_lossy(), second.as_str_lossy());
    }

    #[test_log::test(tokio::test)]
    async fn ensure_cache_location_migrates_on_key_drift() {
        let project = tempfile::tempdir().expect("tempdir");
        let cache_root_dir = tempfile::tempdir().expect("tempdir");
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();
        let cache_root = AbsDirPath::try_from(cache_root_dir.path().to_path_buf()).unwrap();

        let vcs = GitVcs;
        let real_new_path = ensure_cache_location(&vcs, &project_path, &cache_root)
            .await
            .expect("initial call");

        // Simulate a prior run under a stale key: populate a differently
        // named cache directory and point settings at it.
        let stale_path = cache_root.try_join_dir("stale0000-stale0000").unwrap();
        fs::remove_dir_all(&real_new_path).await.unwrap();
        fs::create_dir_all(&stale_path.try_join_dir("branches").unwrap())
            .await
            .unwrap();
        let marker = stale_path
            .try_join_dir("branches")
            .unwrap()
            .try_join_file("main.artifact")
            .unwrap();
        fs::write(&marker, b"present").await.expect("write marker");

        let mut settings = Settings::load_or_create(&vcs, &project_path, &cache_root)
            .await
            .unwrap();
        settings.cache_key = "stale0000-stale0000".to_string();
        settings.cache_location = stale_path.as_str_lossy().into_owned();
        settings.save(&project_path).await.unwrap();

        let new_path = ensure_cache_location(&vcs, &project_path, &cache_root)
            .await
            .expect("migrating call");

        assert_eq!(new_path.as_str_lossy(), real_new_path.as_str_lossy());
        assert!(!fs::exists(stale_path.as_std_path()).await);
        let migrated_marker = new_path
            .try_join_dir("branches")
            .unwrap()
            .try_join_file("main.artifact")
            .unwrap();
        assert!(fs::is_file(migrated_marker.as_std_path()).await);

        let settings = Settings::load_or_create(&vcs, &project_path, &cache_root)
            .await
            .unwrap();
        let expected_key = new_path.file_name_str_lossy().unwrap().into_owned();
        assert_eq!(settings.cache_key, expected_key);
    }
}
