//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(memento::cache::io),
        help("Check file permissions, free disk space, and that the cache root is reachable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "create_dir_all")
        operation: String,
    },

    /// No entry is stored for the requested key
    #[error("Cache entry not found: {key}")]
    #[diagnostic(
        code(memento::cache::not_found),
        help("The entry may have been evicted, cleared, or never written")
    )]
    NotFound {
        /// The key that was not found
        key: String,
    },

    /// The entry exists but its record or output bytes are inconsistent
    #[error("Cache entry {key} is corrupt: {message}")]
    #[diagnostic(
        code(memento::cache::corruption),
        help("Evict the entry and recompute the output")
    )]
    Corruption {
        /// The key of the corrupt entry
        key: String,
        /// What was inconsistent
        message: String,
    },

    /// Another writer already stored an output for this entry
    #[error("Cache entry {key} already has an output")]
    #[diagnostic(
        code(memento::cache::conflict),
        help("A concurrent write won the race; evict the entry before writing again")
    )]
    Conflict {
        /// The contested key
        key: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(memento::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A function or input id cannot be used as a key
    #[error("Invalid cache key: {message}")]
    #[diagnostic(
        code(memento::cache::invalid_key),
        help("Ids must be non-empty and reasonably short; hash long fingerprints first")
    )]
    InvalidKey {
        /// Why the key was rejected
        message: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(memento::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a corruption error
    #[must_use]
    pub fn corruption(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Corruption {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: msg.into(),
        }
    }

    /// True if this error means the entry is absent
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if this error means the entry is present but unusable
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
