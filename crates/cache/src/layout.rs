//! Physical layout of a disk cache root
//!
//! ```text
//! <root>/
//!   staging/                         temp files, detached namespaces
//!   locks/access-<nn>.lock           serialize last-accessed updates
//!   functions/<fn>/function.json     per-function record
//!   functions/<fn>/inputs/<input>/
//!     output                         raw output bytes
//!     metadata.json                  record; its presence commits the entry
//!     last_accessed                  RFC 3339 timestamp
//! ```
//!
//! `<fn>` and `<input>` are the percent-encoded ids from [`crate::keys`].

use crate::keys::{FunctionKey, InputKey};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub(crate) const FUNCTIONS_DIR: &str = "functions";
pub(crate) const INPUTS_DIR: &str = "inputs";
pub(crate) const STAGING_DIR: &str = "staging";
pub(crate) const LOCKS_DIR: &str = "locks";
pub(crate) const FUNCTION_FILE: &str = "function.json";
pub(crate) const OUTPUT_FILE: &str = "output";
pub(crate) const METADATA_FILE: &str = "metadata.json";
pub(crate) const ACCESSED_FILE: &str = "last_accessed";

/// Lock files last-accessed updates are spread over; never deleted
pub(crate) const ACCESS_LOCK_STRIPES: u8 = 64;

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub(crate) fn functions_dir(&self) -> PathBuf {
        self.root.join(FUNCTIONS_DIR)
    }

    pub(crate) fn function_dir(&self, function_key: &FunctionKey) -> PathBuf {
        self.functions_dir().join(function_key.encoded())
    }

    pub(crate) fn function_record_path(&self, function_key: &FunctionKey) -> PathBuf {
        self.function_dir(function_key).join(FUNCTION_FILE)
    }

    pub(crate) fn inputs_dir(&self, function_key: &FunctionKey) -> PathBuf {
        self.function_dir(function_key).join(INPUTS_DIR)
    }

    pub(crate) fn entry_dir(&self, input_key: &InputKey) -> PathBuf {
        self.inputs_dir(input_key.function_key())
            .join(input_key.encoded())
    }

    pub(crate) fn output_path(&self, input_key: &InputKey) -> PathBuf {
        self.entry_dir(input_key).join(OUTPUT_FILE)
    }

    pub(crate) fn metadata_path(&self, input_key: &InputKey) -> PathBuf {
        self.entry_dir(input_key).join(METADATA_FILE)
    }

    pub(crate) fn accessed_path(&self, input_key: &InputKey) -> PathBuf {
        self.entry_dir(input_key).join(ACCESSED_FILE)
    }

    pub(crate) fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    /// Lock file guarding the last-accessed timestamp of `input_key`
    ///
    /// Stable across evict, clear and adopt, so every updater of one key
    /// contends on the same file.
    pub(crate) fn access_lock_path(&self, input_key: &InputKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(input_key.function_key().encoded().as_bytes());
        hasher.update(b"/");
        hasher.update(input_key.encoded().as_bytes());
        let stripe = hasher.finalize()[0] % ACCESS_LOCK_STRIPES;
        self.locks_dir().join(format!("access-{stripe:02x}.lock"))
    }
}
