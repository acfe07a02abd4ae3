//! The cache abstraction
//!
//! [`Cache`] is the capability set every backend provides. `read` and `write`
//! are provided methods composed from the primitives, so every backend gets
//! the same ordering guarantees:
//!
//! - `read`: refresh last-accessed, load metadata, load output bytes.
//! - `write`: evict, persist output, persist metadata (commit), set
//!   last-accessed.
//!
//! Metadata is the existence marker and is always written last, so neither
//! `exists` nor `list` ever reports an entry whose output is still in flight.
//!
//! A backend may override `write` when it can publish the whole entry at
//! once, as long as the observable order stays the same.

use crate::keys::{FunctionKey, InputKey};
use crate::metadata::Metadata;
use crate::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// A persistent store of function outputs addressed by [`InputKey`]
pub trait Cache: Send + Sync {
    /// True iff a complete, committed entry is present
    fn exists(&self, input_key: &InputKey) -> Result<bool>;

    /// All committed entries owned by `function_key`, sorted by input id
    fn list(&self, function_key: &FunctionKey) -> Result<Vec<InputKey>>;

    /// Remove one entry; a missing entry is not an error
    fn evict(&self, input_key: &InputKey) -> Result<()>;

    /// Remove every entry owned by `function_key`
    fn clear(&self, function_key: &FunctionKey) -> Result<()>;

    /// Move every entry of `from` under `to` without touching output bytes
    ///
    /// When `to` already holds an entry with the same input id, the adopted
    /// entry replaces it.
    fn adopt(&self, from: &FunctionKey, to: &FunctionKey) -> Result<()>;

    /// Load the output bytes of a committed entry
    fn read_output(&self, input_key: &InputKey) -> Result<Vec<u8>>;

    /// Atomically persist output bytes (not yet visible until metadata is dumped)
    ///
    /// Fails with [`crate::Error::Conflict`] if the entry already holds an
    /// output; `write` evicts first.
    fn write_output(&self, output: &[u8], input_key: &InputKey) -> Result<()>;

    /// Load the caller metadata of a committed entry
    ///
    /// Fails with [`crate::Error::NotFound`] if there is no entry and with
    /// [`crate::Error::Corruption`] if the stored record cannot be decoded.
    fn load_metadata(&self, input_key: &InputKey) -> Result<Metadata>;

    /// Atomically persist metadata, committing the entry
    ///
    /// The output must already be present.
    fn dump_metadata(&self, metadata: &Metadata, input_key: &InputKey) -> Result<()>;

    /// Physical location of the output, for callers needing file-level access
    ///
    /// `None` for backends without file storage. The path only exists once a
    /// write has completed.
    fn get_output_path(&self, input_key: &InputKey) -> Option<PathBuf>;

    /// Record an access now; never moves the timestamp backwards
    fn update_last_accessed(&self, input_key: &InputKey) -> Result<()>;

    /// Last recorded access, `None` if never recorded
    fn get_last_accessed(&self, input_key: &InputKey) -> Result<Option<DateTime<Utc>>>;

    /// Read a cached output
    ///
    /// If the entry is evicted concurrently the read fails with
    /// [`crate::Error::NotFound`].
    fn read(&self, input_key: &InputKey) -> Result<Vec<u8>> {
        self.update_last_accessed(input_key)?;
        let _metadata = self.load_metadata(input_key)?;
        self.read_output(input_key)
    }

    /// Store an output, replacing any previous entry for the key
    fn write(&self, output: &[u8], metadata: &Metadata, input_key: &InputKey) -> Result<()> {
        self.evict(input_key)?;
        self.write_output(output, input_key)?;
        self.dump_metadata(metadata, input_key)?;
        self.update_last_accessed(input_key)
    }
}

/// Monotonic timestamp update: the later of `now` and `previous`
pub(crate) fn next_access(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.map_or(now, |prev| prev.max(now))
}
