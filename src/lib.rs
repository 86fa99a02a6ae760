//! Library for `cortexd`.
//!
//! This library is not intended to be used directly and is unsupported in
//! that configuration. It's only a library to enable sharing code between
//! the `cortexd` binary and its integration tests.

pub mod actor;
pub mod cache;
pub mod fs;
pub mod indexer;
pub mod path;
pub mod registry;
pub mod server;
pub mod vcs;
pub mod watch;
