//! Eviction Engine: applies an age/size/protection policy over Cache
//! Metadata, deleting branch artifacts that fall outside it (spec.md §4.6).

use std::collections::HashSet;

use color_eyre::Result;
use jiff::Timestamp;
use serde::Serialize;
use tracing::{instrument, warn};

use crate::cache::metadata::{CacheMetadata, PROTECTED_BRANCHES};
use crate::fs;
use crate::path::{AbsDirPath, TryJoinWith};
use crate::vcs::GitVcs;

/// Eviction policy knobs (spec.md §4.6). Defaults: 30 days, 500 MB,
/// `{"main", "master"}`.
#[derive(Clone, Debug)]
pub struct EvictionPolicy {
    pub max_age_days: i64,
    pub max_size_mb: f64,
    pub protect_branches: HashSet<String>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_size_mb: 500.0,
            protect_branches: PROTECTED_BRANCHES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Result of a single eviction pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EvictionReport {
    pub evicted_branches: Vec<String>,
    pub freed_mb: f64,
    pub remaining_mb: f64,
    pub duration_ms: u64,
}

struct Candidate {
    name: String,
    last_accessed: Timestamp,
    deleted: bool,
}

/// Run one eviction pass against `cache_dir`'s metadata.
#[instrument(name = "run_eviction", skip(vcs, policy))]
pub async fn run_eviction(
    vcs: &GitVcs,
    project_path: &AbsDirPath,
    cache_dir: &AbsDirPath,
    policy: &EvictionPolicy,
) -> Result<EvictionReport> {
    let started = std::time::Instant::now();
    let mut metadata = CacheMetadata::load(cache_dir).await?;

    let live_set = live_branch_set(vcs, project_path).await;
    let current_branch = vcs.current_branch(project_path).await;

    let mut candidates: Vec<Candidate> = metadata
        .branches
        .iter()
        .filter(|(name, meta)| {
            name.as_str() != current_branch
                && !policy.protect_branches.contains(*name)
                && !meta.is_immortal
        })
        .map(|(name, meta)| Candidate {
            name: name.clone(),
            last_accessed: meta.last_accessed,
            deleted: live_set
                .as_ref()
                .is_some_and(|live| !live.contains(name.as_str())),
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.deleted
            .cmp(&a.deleted)
            .then_with(|| a.last_accessed.cmp(&b.last_accessed))
    });

    let now = Timestamp::now();
    let mut evicted_branches = Vec::new();
    let mut freed_mb = 0.0;

    for candidate in &candidates {
        let should_evict = if candidate.deleted {
            true
        } else if policy.max_age_days > 0 && age_exceeds(now, candidate.last_accessed, policy.max_age_days) {
            true
        } else {
            policy.max_size_mb > 0.0 && metadata.total_size_mb > policy.max_size_mb
        };

        if !should_evict {
            continue;
        }

        let size_before = metadata
            .branch_stats(&candidate.name)
            .map(|b| b.size_mb)
            .unwrap_or(0.0);

        if let Err(err) = evict_branch(cache_dir, &candidate.name).await {
            warn!(branch = %candidate.name, error = ?err, "failed to delete branch artifact, skipping");
            continue;
        }

        metadata.remove_branch(&candidate.name);
        evicted_branches.push(candidate.name.clone());
        freed_mb += size_before;
    }

    metadata.last_eviction = now;
    metadata.save(cache_dir).await?;

    Ok(EvictionReport {
        evicted_branches,
        freed_mb,
        remaining_mb: metadata.total_size_mb,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn age_exceeds(now: Timestamp, last_accessed: Timestamp, max_age_days: i64) -> bool {
    let elapsed_secs = now.as_second() - last_accessed.as_second();
    let threshold_secs = max_age_days.saturating_mul(24 * 60 * 60);
    elapsed_secs > threshold_secs
}

async fn evict_branch(cache_dir: &AbsDirPath, branch: &str) -> Result<()> {
    let path = cache_dir
        .try_join_dir("branches")?
        .try_join_file(format!("{branch}.artifact"))?;
    fs::remove_file(&path).await
}

/// The set of live branch names, normalized per spec.md §4.6: trim
/// whitespace and a leading `"* "`; strip a leading `remotes/origin/`;
/// drop entries containing `HEAD`; drop entries under non-origin remotes
/// (`remotes/<other>/`).
///
/// Returns `None` if VCS fails — callers must then treat every candidate
/// as not-deleted, per the spec's intentional divergence from the
/// source's "empty live set flags everything" behavior (Design Notes #2).
async fn live_branch_set(vcs: &GitVcs, project_path: &AbsDirPath) -> Option<HashSet<String>> {
    let raw = vcs.branches(project_path).await.ok()?;
    Some(
        raw.into_iter()
            .filter_map(|line| normalize_branch_line(&line))
            .collect(),
    )
}

fn normalize_branch_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix("* ").unwrap_or(trimmed).trim();

    if trimmed.contains("HEAD") {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix("remotes/origin/") {
        return Some(rest.to_string());
    }

    if trimmed.starts_with("remotes/") {
        return None;
    }

    if trimmed.is_empty() {
        return None;
    }

    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn normalize_branch_line_variants() {
        assert_eq!(normalize_branch_line("  main"), Some("main".to_string()));
        assert_eq!(normalize_branch_line("* main"), Some("main".to_string()));
        assert_eq!(
            normalize_branch_line("  remotes/origin/feature"),
            Some("feature".to_string())
        );
        assert_eq!(normalize_branch_line("  remotes/origin/HEAD -> origin/main"), None);
        assert_eq!(normalize_branch_line("  remotes/upstream/feature"), None);
        assert_eq!(normalize_branch_line(""), None);
    }

    fn policy_with_age(max_age_days: i64, max_size_mb: f64) -> EvictionPolicy {
        EvictionPolicy {
            max_age_days,
            max_size_mb,
            ..Default::default()
        }
    }

    async fn tmp_cache_dir() -> (tempfile::TempDir, AbsDirPath) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abcd1234-deadbeef");
        let typed = AbsDirPath::try_from(path).expect("typed path");
        fs::create_dir_all(&typed.try_join_dir("branches").unwrap())
            .await
            .expect("mkdir branches");
        (dir, typed)
    }

    async fn write_artifact(cache_dir: &AbsDirPath, branch: &str, bytes: usize) {
        let path = cache_dir
            .try_join_dir("branches")
            .unwrap()
            .try_join_file(format!("{branch}.artifact"))
            .unwrap();
        fs::write(&path, vec![0u8; bytes]).await.expect("write artifact");
    }

    async fn init_repo_with_branches(path: &std::path::Path) {
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
        for args in [
            vec!["add", "."],
            vec!["commit", "-q", "-m", "init"],
            vec!["branch", "feature/kept"],
        ] {
            tokio::process::Command::new("git")
                .args(&args)
                .current_dir(path)
                .status()
                .await
                .expect("run git");
        }
    }

    #[test_log::test(tokio::test)]
    async fn evicts_branch_deleted_from_vcs_but_preserves_immortal_and_live() {
        let (_dir, cache_dir) = tmp_cache_dir().await;
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("main", 10.0, 1);
        metadata.update_branch_stats("feature/kept", 3.0, 1);
        metadata.update_branch_stats("feature/deleted", 5.0, 1);
        metadata.save(&cache_dir).await.unwrap();
        write_artifact(&cache_dir, "main", 1024).await;
        write_artifact(&cache_dir, "feature/kept", 1024).await;
        write_artifact(&cache_dir, "feature/deleted", 1024).await;

        let project = tempfile::tempdir().unwrap();
        init_repo_with_branches(project.path()).await;
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let policy = policy_with_age(0, 0.0);
        let report = run_eviction(&vcs_noop(), &project_path, &cache_dir, &policy)
            .await
            .expect("eviction");

        assert_eq!(report.evicted_branches, vec!["feature/deleted".to_string()]);
        assert_eq!(report.freed_mb, 5.0);

        let metadata = CacheMetadata::load(&cache_dir).await.unwrap();
        assert!(metadata.branch_stats("main").is_some());
        assert!(metadata.branch_stats("feature/kept").is_some());
        assert!(metadata.branch_stats("feature/deleted").is_none());
    }

    #[test_log::test(tokio::test)]
    async fn vcs_failure_marks_nothing_deleted() {
        let (_dir, cache_dir) = tmp_cache_dir().await;
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("main", 10.0, 1);
        metadata.update_branch_stats("feature/x", 5.0, 1);
        metadata.save(&cache_dir).await.unwrap();
        write_artifact(&cache_dir, "main", 1024).await;
        write_artifact(&cache_dir, "feature/x", 1024).await;

        // Not a git repository: `branches()` errors, so the live set is
        // unknown; per spec.md §4.6/§9 this must mark zero branches
        // deleted, never all of them.
        let project = tempfile::tempdir().unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let policy = policy_with_age(0, 0.0);
        let report = run_eviction(&vcs_noop(), &project_path, &cache_dir, &policy)
            .await
            .expect("eviction");

        assert!(report.evicted_branches.is_empty());
        let metadata = CacheMetadata::load(&cache_dir).await.unwrap();
        assert!(metadata.branch_stats("feature/x").is_some());
    }

    #[test_log::test(tokio::test)]
    async fn evicts_over_size_budget_oldest_first() {
        let (_dir, cache_dir) = tmp_cache_dir().await;
        let mut metadata = CacheMetadata::empty(&cache_dir);
        metadata.update_branch_stats("main", 5.0, 1);
        metadata.save(&cache_dir).await.unwrap();

        // Two non-immortal branches, 10 MB each, pushing total over budget.
        metadata.update_branch_stats("feature/old", 10.0, 1);
        metadata.update_branch_stats("feature/new", 10.0, 1);
        metadata.save(&cache_dir).await.unwrap();
        write_artifact(&cache_dir, "main", 1024).await;
        write_artifact(&cache_dir, "feature/old", 1024).await;
        write_artifact(&cache_dir, "feature/new", 1024).await;

        let project = tempfile::tempdir().unwrap();
        let project_path = AbsDirPath::try_from(project.path().to_path_buf()).unwrap();

        let policy = policy_with_age(0, 20.0);
        let report = run_eviction(&vcs_noop(), &project_path, &cache_dir, &policy)
            .await
            .expect("eviction");

        assert!(!report.evicted_branches.is_empty());
        let metadata = CacheMetadata::load(&cache_dir).await.unwrap();
        assert!(metadata.branch_stats("main").is_some());
    }

    fn vcs_noop() -> GitVcs {
        GitVcs
    }
}
