//! Persistent memoization cache
//!
//! Outputs of expensive, deterministic functions are stored under an
//! [`InputKey`] (a function's identity plus an input fingerprint) and read
//! back instead of recomputing.
//!
//! # Overview
//!
//! - [`Cache`] is the backend-neutral capability set; `read` and `write` are
//!   composed from its primitives with a fixed ordering.
//! - [`DiskCache`] persists entries under a root directory. Every file is
//!   written to a staging area and renamed into place, and an entry becomes
//!   visible only once its metadata record lands.
//! - [`MemoryCache`] keeps everything in process, for tests.
//! - [`prune`] evicts idle entries of one function under a [`PrunePolicy`].
//!
//! Outputs are opaque bytes; serializing values is the caller's concern.

// TODO(cache-docs): Add # Errors documentation to all fallible public functions
#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

mod atomic;
mod cache;
pub mod config;
mod disk;
mod error;
mod keys;
mod layout;
mod memory;
mod metadata;
mod prune;

// Re-export error types at crate root
pub use error::{Error, Result};

pub use atomic::{AtomicFile, write_atomic};
pub use cache::Cache;
pub use config::{CACHE_DIR_ENV, cache_root};
pub use disk::{DiskCache, FunctionStats, FunctionSummary};
pub use keys::{FunctionKey, InputKey, MAX_COMPONENT_LEN};
pub use memory::MemoryCache;
pub use metadata::{FunctionRecord, GitProvenance, Metadata, OutputDigest, create_metadata};
pub use prune::{PrunePolicy, PruneReport, prune};
