//! Opaque external collaborators: the indexer and the embedding resource.
//!
//! Both are deliberately out of scope for this crate (spec.md §1): the
//! file discovery / parser / chunker / formatter pipeline and the
//! embedding provider live elsewhere. What lives here is the seam the
//! Actor and Server hold them through.

use std::future::Future;
use std::pin::Pin;

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::path::{AbsDirPath, AbsFilePath};

/// Outcome of a single `Indexer::index` call.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct IndexStats {
    /// Total number of files considered during this run.
    pub files_total: u64,

    /// Number of files actually processed (parsed/chunked/embedded).
    pub files_processed: u64,

    /// Number of chunks produced across all processed files.
    pub chunks_generated: u64,
}

/// The opaque driver that turns source files into cache artifact content.
///
/// A single contract: given a set of hinted paths (or none, for a full
/// index), index what's needed and report aggregate stats. Everything
/// about *how* that happens — discovery, parsing, chunking, embedding,
/// writing the artifact — is outside this crate's scope.
///
/// Object-safe so the Actor can hold `Arc<dyn Indexer>` without needing to
/// be generic over the concrete indexer implementation.
pub trait Indexer: Send + Sync {
    /// Drive an index run.
    ///
    /// `hinted_paths` is empty for a full re-index (e.g. after a branch
    /// switch); non-empty to hint which paths changed (e.g. after a file
    /// watcher batch). The indexer decides what actually needs rebuilding.
    fn index<'a>(
        &'a self,
        project_path: &'a AbsDirPath,
        hinted_paths: &'a [AbsFilePath],
    ) -> Pin<Box<dyn Future<Output = Result<IndexStats>> + Send + 'a>>;
}

/// The shared embedding resource.
///
/// Constructed once by the [`crate::server::Server`] and borrowed by every
/// [`crate::actor::Actor`] it creates (see `SPEC_FULL.md` §10.5): ownership
/// is single, actors hold only a borrow, and there is intentionally no
/// `close`/`shutdown` method on this trait. The resource is released via
/// `Drop` once the Server's own reference (and every Actor's clone of it)
/// goes out of scope.
pub trait Embedder: Send + Sync {}

/// Test double for [`Indexer`] that reports a fixed, zero-cost result.
///
/// Useful for exercising the Actor's state machine and pause/resume
/// discipline without a real chunker/parser pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullIndexer {
    pub stats: IndexStats,
}

impl Indexer for NullIndexer {
    fn index<'a>(
        &'a self,
        _project_path: &'a AbsDirPath,
        _hinted_paths: &'a [AbsFilePath],
    ) -> Pin<Box<dyn Future<Output = Result<IndexStats>> + Send + 'a>> {
        Box::pin(async move { Ok(self.stats) })
    }
}

/// Test double for [`Embedder`] with no internal state.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEmbedder;

impl Embedder for NullEmbedder {}
