//! Filesystem operations tailored to `cortexd`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! ## Other IO implementations
//!
//! We may find that we want to swap to a different IO backend than tokio:
//! - https://docs.rs/compio/latest/compio/
//! - https://docs.rs/nuclei/latest/nuclei/
//! - https://docs.rs/monoio/latest/monoio/
//! - https://docs.rs/rio/latest/rio/
//!
//! I've held off on this for now until/unless we can prove that
//! tokio and its default way of interfacing with the file system is
//! actually the bottleneck for us.

#![allow(
    clippy::disallowed_methods,
    reason = "The methods are disallowed elsewhere, but we need them here!"
)]

use std::convert::identity;
use std::fmt::Debug as StdDebug;

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use futures::{Stream, TryStreamExt};
use tap::{Pipe, TapFallible};
use tokio::fs::ReadDir;
use tokio::task::spawn_blocking;
use tracing::{debug, error, instrument, trace};
use uuid::Uuid;

use crate::path::{Abs, AbsDirPath, AbsFilePath, JoinWith, RelativeTo, TypedPath};

/// Determine the canonical cache root for the current user.
///
/// Unlike platform-conventional cache directories (XDG, `Library/Caches`,
/// `%LOCALAPPDATA%`), `cortexd` always places its cache at a fixed path
/// relative to the user's home directory so that the location is
/// predictable across platforms and easy to document.
///
/// ## Errors
///
/// This can fail if the user has no home directory or if it cannot be
/// accessed.
#[instrument]
pub async fn user_cache_root() -> Result<AbsDirPath> {
    let home = spawn_blocking(homedir::my_home)
        .await
        .context("join task")?
        .context("get user home directory")?
        .ok_or_eyre("user has no home directory")?;

    home.join(".cortex")
        .join("cache")
        .pipe(AbsDirPath::try_from)
        .tap_ok(|dir| debug!(?dir, "user cache root"))
}

/// Determine the canonical config root for the current user.
///
/// Houses the projects registry and any user-wide daemon state that isn't
/// part of the per-project cache tree.
#[instrument]
pub async fn user_config_root() -> Result<AbsDirPath> {
    let home = spawn_blocking(homedir::my_home)
        .await
        .context("join task")?
        .context("get user home directory")?
        .ok_or_eyre("user has no home directory")?;

    home.join(".cortex")
        .pipe(AbsDirPath::try_from)
        .tap_ok(|dir| debug!(?dir, "user config root"))
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &AbsDirPath) -> Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Walk files in a directory recursively.
///
/// Only emits regular files; symbolic links and directories are not emitted
/// in the stream.
#[instrument]
pub fn walk_files(root: &AbsDirPath) -> impl Stream<Item = Result<AbsFilePath>> + Unpin {
    let (tx, rx) = flume::bounded::<Result<AbsFilePath>>(0);
    let root = root.clone();

    spawn_blocking(move || {
        for entry in walkdir::WalkDir::new(root.as_std_path()) {
            let entry = match entry.with_context(|| format!("walk files in {root:?}")) {
                Ok(entry) => entry,
                Err(err) => {
                    if let Err(send) = tx.send(Err(err)) {
                        let err = send.into_inner();
                        error!(error = ?err, "unable to walk files");
                        return;
                    }
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = match AbsFilePath::try_from(entry.path()) {
                Ok(path) => path,
                Err(err) => {
                    if let Err(send) = tx.send(Err(err)) {
                        let err = send.into_inner();
                        error!(error = ?err, "unable to walk files");
                        return;
                    }
                    continue;
                }
            };

            if let Err(send) = tx.send(Ok(path)) {
                let err = send.into_inner();
                error!(error = ?err, "unable to walk files");
                return;
            }
        }
    });

    rx.into_stream().pipe(Box::pin)
}

/// Report whether the provided directory is empty.
///
/// For the purpose of this function, the directory is empty if it has no
/// regular files.
#[instrument]
pub async fn is_dir_empty(path: &AbsDirPath) -> Result<bool> {
    walk_files(path)
        .try_any(|_| async { true })
        .await
        .map(|found| !found)
}

/// Buffer the file content from disk.
#[instrument]
pub async fn read_buffered(path: &AbsFilePath) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_buffered_utf8(path: &AbsFilePath) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk.
///
/// This is **not** atomic; concurrent readers can observe a torn write.
/// Use [`write_atomic`] for any file that must never be observed partially
/// written (settings, cache metadata, the projects registry).
#[instrument(skip(content))]
pub async fn write(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(&parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path.as_std_path(), content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Write the provided file content to disk atomically.
///
/// Writes to a uuid-suffixed temporary file in the same directory as `path`,
/// then renames it into place. Renames within a filesystem are atomic, so
/// readers either see the old content or the new content in full, never a
/// torn write. The temporary file is best-effort cleaned up if the write
/// fails before the rename.
#[instrument(skip(content))]
pub async fn write_atomic(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    let parent = path.parent().ok_or_eyre("path has no parent directory")?;
    create_dir_all(&parent)
        .await
        .context("create parent directory")?;

    let tmp_name = format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default(),
        Uuid::new_v4()
    );
    let tmp_path = parent.join(tmp_name).pipe(AbsFilePath::try_from)?;

    if let Err(err) = tokio::fs::write(tmp_path.as_std_path(), content)
        .await
        .with_context(|| format!("write temp file: {tmp_path:?}"))
    {
        let _ = tokio::fs::remove_file(tmp_path.as_std_path()).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .await
        .with_context(|| format!("rename {tmp_path:?} -> {path:?}"))
    {
        let _ = tokio::fs::remove_file(tmp_path.as_std_path()).await;
        return Err(err);
    }

    trace!(?path, bytes = content.len(), "wrote file atomically");
    Ok(())
}

/// Remove a file.
///
/// No-op (returns `Ok`) if the file doesn't exist.
#[instrument]
pub async fn remove_file(path: &AbsFilePath) -> Result<()> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, "removed file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Rename a file or folder, overwriting the destination if it already exists.
#[instrument]
pub async fn rename<T>(src: &TypedPath<Abs, T>, dst: &TypedPath<Abs, T>) -> Result<()> {
    tokio::fs::rename(src.as_std_path(), dst.as_std_path())
        .await
        .with_context(|| format!("rename file: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename file"))
}

/// Read directory entries.
#[instrument]
pub async fn read_dir(path: &AbsDirPath) -> Result<ReadDir> {
    tokio::fs::read_dir(path.as_std_path())
        .await
        .with_context(|| format!("read directory: {path:?}"))
        .tap_ok(|_| trace!(?path, "read directory"))
}

/// Remove the directory and all its contents.
///
/// No-op (returns `Ok`) if the directory doesn't exist.
#[instrument]
pub async fn remove_dir_all(path: &AbsDirPath) -> Result<()> {
    match tokio::fs::remove_dir_all(path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Get the standard metadata for the path, if it exists.
#[instrument]
pub async fn metadata(
    path: impl AsRef<std::path::Path> + StdDebug,
) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            trace!(?path, ?metadata, "stat metadata");
            Ok(Some(metadata))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat metadata: {path:?}")),
    }
}

/// Check whether the path exists.
///
/// Returns `false` if there is an error checking whether the path exists.
/// Note that this sort of check is prone to race conditions - if you plan
/// to do anything with the file after checking, you should probably just try
/// to do the operation and handle the case of the file not existing.
#[instrument]
pub async fn exists(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.is_ok_and(identity)
}

/// Return whether the path represents a directory.
///
/// Returns `false` if the directory doesn't exist or if there is an error
/// checking the metadata; to differentiate this case use [`metadata`].
#[instrument]
pub async fn is_dir(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_dir()))
}

/// Return whether the path represents a normal file.
///
/// Returns `false` if the file doesn't exist, or if there is an error
/// checking the metadata; to differentiate this case use [`metadata`].
#[instrument]
pub async fn is_file(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_file()))
}
