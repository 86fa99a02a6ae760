//! Cache identity: deriving a stable `cache_key` from VCS state.

use sha2::{Digest, Sha256};

use crate::path::AbsDirPath;
use crate::vcs::GitVcs;

/// Literal remote-hash used when no remote is configured.
pub const NO_REMOTE_HASH: &str = "00000000";

/// `<remote-hash>-<worktree-hash>`, each an 8-char lowercase hex prefix of
/// the SHA-256 digest of the normalized remote URL / absolute worktree
/// root respectively (spec.md §3/§4.2).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the cache key for the project at `path`.
    ///
    /// Deterministic for a given (normalized remote, worktree root): two
    /// different worktrees of the same remote share a remote-hash but
    /// differ in worktree-hash, so each clone is isolated.
    pub async fn derive(vcs: &GitVcs, path: &AbsDirPath) -> Self {
        let remote = vcs.remote_url(path).await;
        let worktree_root = vcs.worktree_root(path).await;
        Self::from_parts(&remote, &worktree_root)
    }

    /// Derive a cache key directly from a remote URL and worktree root,
    /// without going through VCS operations. Exposed for tests and for
    /// recomputing a key from persisted Settings fields.
    pub fn from_parts(remote_url: &str, worktree_root: &str) -> Self {
        let remote_hash = if remote_url.trim().is_empty() {
            NO_REMOTE_HASH.to_string()
        } else {
            hash8(&normalize_remote(remote_url))
        };
        let worktree_hash = hash8(worktree_root);
        Self(format!("{remote_hash}-{worktree_hash}"))
    }

    /// The string form of the key, as used for directory names.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// First 8 hex chars of the SHA-256 digest of `input`, lowercase.
fn hash8(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex = hex_lower(&digest);
    hex[..8].to_string()
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("write to String never fails");
    }
    out
}

/// Normalize a remote URL per spec.md §3, applied in order:
/// trim whitespace; strip one of the prefixes `https://`, `http://`,
/// `ssh://`, `git://`; strip a trailing `.git`; if the result starts with
/// `git@`, strip `git@` and replace the first `:` with `/`.
///
/// Idempotent: `normalize(normalize(u)) == normalize(u)` for all `u`.
pub fn normalize_remote(url: &str) -> String {
    let mut s = url.trim().to_string();
    if s.is_empty() {
        return s;
    }

    for prefix in ["https://", "http://", "ssh://", "git://"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }

    if let Some(rest) = s.strip_suffix(".git") {
        s = rest.to_string();
    }

    if let Some(rest) = s.strip_prefix("git@") {
        s = match rest.split_once(':') {
            Some((host, path)) => format!("{host}/{path}"),
            None => rest.to_string(),
        };
    }

    s
}
