//! Filesystem-backed cache
//!
//! Every persisted artifact goes through [`crate::atomic`], and every removal
//! of a directory is a rename into the staging area followed by a delete, so
//! entries and whole function namespaces appear and disappear atomically.
//!
//! ## Concurrency policy
//!
//! - Concurrent `write`s to one key: last published entry wins. `write`
//!   assembles the whole entry directory in staging and publishes it with
//!   one rename, replacing whatever another writer published meanwhile; a
//!   writer whose function namespace is removed mid-write fails with
//!   [`Error::NotFound`] and leaves nothing visible.
//! - The primitives never replace an output in place (`write_output` fails
//!   with [`Error::Conflict`]), but callers composing `write_output` and
//!   `dump_metadata` themselves must not race other writers of the key.
//! - `read` racing `evict` or an overwrite: fails with [`Error::NotFound`];
//!   bytes are only returned when the record read before and after loading
//!   them is identical and matches the bytes' digest.
//! - `clear` racing `write`: entries committed before the namespace is
//!   detached are cleared, later writes survive.
//! - `adopt` racing writers to `from`: entries not yet committed when adopt
//!   runs are discarded together with the old namespace.
//! - Last-accessed updates (including the stamp `write` publishes) hold an
//!   exclusive lock on one of a fixed set of files under `locks/`, so the
//!   stored timestamp of a key never decreases, across threads and processes.

use crate::atomic::{self, AtomicFile, TEMP_PREFIX};
use crate::cache::{Cache, next_access};
use crate::keys::{FunctionKey, InputKey, decode_component};
use crate::layout::{ACCESSED_FILE, Layout, METADATA_FILE, OUTPUT_FILE};
use crate::metadata::{EntryRecord, FunctionRecord, Metadata, OutputDigest, RECORD_VERSION};
use crate::{Error, Result, config};
use chrono::{DateTime, SecondsFormat, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

/// Prefix of directories holding detached (about to be deleted) trees
const DETACHED_PREFIX: &str = ".detached-";

/// Prefix of directories where whole entries are assembled before publishing
const STAGED_PREFIX: &str = ".staged-";

/// How often `write` replaces a concurrently published entry before giving up
const PUBLISH_ATTEMPTS: usize = 8;

/// Summary of the committed entries of one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionStats {
    /// Number of committed entries
    pub entries: usize,
    /// Bytes on disk used by those entries (output, record, timestamp)
    pub total_bytes: u64,
}

/// One function namespace with its record and disk usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSummary {
    /// The function owning the namespace
    pub function_key: FunctionKey,
    /// Its record, if one was ever dumped
    pub record: Option<FunctionRecord>,
    /// Committed entries and their size
    pub stats: FunctionStats,
}

/// A [`Cache`] persisted under one root directory
#[derive(Debug, Clone)]
pub struct DiskCache {
    layout: Layout,
}

impl DiskCache {
    /// Create a cache rooted at `root`; directories are created lazily
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::new(root),
        }
    }

    /// Create a cache at the root resolved from the environment
    ///
    /// See [`config::cache_root`] for the lookup order.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(config::cache_root()?))
    }

    /// The cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Function keys that currently own a namespace, sorted
    pub fn list_functions(&self) -> Result<Vec<FunctionKey>> {
        let dir = self.layout.functions_dir();
        let mut keys: Vec<FunctionKey> = read_dir_names(&dir)?
            .iter()
            .filter_map(|name| decode_component(name))
            .filter_map(|id| FunctionKey::new(id).ok())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Entry count and disk usage for one function
    pub fn stats(&self, function_key: &FunctionKey) -> Result<FunctionStats> {
        let mut stats = FunctionStats::default();
        for key in self.list(function_key)? {
            let dir = self.layout.entry_dir(&key);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                // Evicted since listing
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io(e, &dir, "read_dir")),
            };
            stats.entries += 1;
            for entry in entries {
                let entry = entry.map_err(|e| Error::io(e, &dir, "read_dir_entry"))?;
                match entry.metadata() {
                    Ok(meta) if meta.is_file() => stats.total_bytes += meta.len(),
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(e, entry.path(), "metadata")),
                }
            }
        }
        Ok(stats)
    }

    /// Store the record of `function_key` unless it already has one
    ///
    /// The first record wins, also among concurrent callers. Returns whether
    /// this call wrote it.
    pub fn dump_function_metadata(
        &self,
        function_key: &FunctionKey,
        metadata: &Metadata,
    ) -> Result<bool> {
        let path = self.layout.function_record_path(function_key);
        if path.exists() {
            return Ok(false);
        }
        let record = FunctionRecord::new(function_key, metadata.clone());
        let json = serde_json::to_vec_pretty(&record).map_err(|e| {
            Error::serialization(format!("Failed to serialize function record: {e}"))
        })?;

        let dir = self.layout.function_dir(function_key);
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        let staging = self.ensure_staging()?;
        let mut file = AtomicFile::create(&staging, &path)?;
        file.write_all(&json)
            .map_err(|e| Error::io(e, file.temp_path(), "write"))?;
        match file.commit_new() {
            Ok(()) => {
                debug!(function = %function_key, "Stored function record");
                Ok(true)
            }
            Err(Error::Io { ref source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The record of `function_key`, `None` if it never got one
    pub fn load_function_metadata(
        &self,
        function_key: &FunctionKey,
    ) -> Result<Option<FunctionRecord>> {
        let path = self.layout.function_record_path(function_key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            Error::corruption(
                function_key.to_string(),
                format!("unreadable function record: {e}"),
            )
        })
    }

    /// Every function namespace with its record and statistics
    ///
    /// Sorted by record creation time; functions without a record come first.
    /// An unreadable record is reported as missing.
    pub fn list_functions_with_metadata(&self) -> Result<Vec<FunctionSummary>> {
        let mut summaries = Vec::new();
        for function_key in self.list_functions()? {
            let record = match self.load_function_metadata(&function_key) {
                Ok(record) => record,
                Err(e) if e.is_corruption() => {
                    warn!(
                        function = %function_key,
                        error = %e,
                        "Ignoring unreadable function record"
                    );
                    None
                }
                Err(e) => return Err(e),
            };
            let stats = self.stats(&function_key)?;
            summaries.push(FunctionSummary {
                function_key,
                record,
                stats,
            });
        }
        summaries.sort_by(|a, b| {
            let created = |s: &FunctionSummary| s.record.as_ref().map(|r| r.created_at);
            created(a)
                .cmp(&created(b))
                .then_with(|| a.function_key.cmp(&b.function_key))
        });
        Ok(summaries)
    }

    /// Remove staging debris (temp files, detached trees) older than `older_than`
    ///
    /// Writers that crash leave their temporary files behind; nothing else
    /// ever reads them. Returns the number of items removed.
    pub fn purge_staging(&self, older_than: Duration) -> Result<usize> {
        let staging = self.layout.staging_dir();
        let entries = match fs::read_dir(&staging) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(e, &staging, "read_dir")),
        };
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, &staging, "read_dir_entry"))?;
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io(e, &path, "metadata")),
            };
            let modified = meta.modified().map_err(|e| Error::io(e, &path, "modified"))?;
            if modified > cutoff {
                continue;
            }
            let result = if meta.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(e, &path, "remove")),
            }
        }
        if removed > 0 {
            debug!(removed, "Purged stale staging items");
        }
        Ok(removed)
    }

    fn ensure_staging(&self) -> Result<PathBuf> {
        let staging = self.layout.staging_dir();
        fs::create_dir_all(&staging).map_err(|e| Error::io(e, &staging, "create_dir_all"))?;
        Ok(staging)
    }

    /// Exclusive lock on the access stripe of `input_key`, released on drop
    fn lock_access(&self, input_key: &InputKey) -> Result<fs::File> {
        let dir = self.layout.locks_dir();
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        let path = self.layout.access_lock_path(input_key);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path, "open"))?;
        FileExt::lock_exclusive(&file).map_err(|e| Error::io(e, &path, "lock"))?;
        Ok(file)
    }

    fn read_record(&self, input_key: &InputKey) -> Result<EntryRecord> {
        let path = self.layout.metadata_path(input_key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(input_key.to_string()));
            }
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let record: EntryRecord = serde_json::from_slice(&bytes).map_err(|e| {
            Error::corruption(input_key.to_string(), format!("unreadable record: {e}"))
        })?;
        if record.version > RECORD_VERSION {
            return Err(Error::corruption(
                input_key.to_string(),
                format!("unsupported record version {}", record.version),
            ));
        }
        Ok(record)
    }

    /// Move `path` into the staging area and delete it there
    ///
    /// Returns `false` if there was nothing at `path`.
    fn detach(&self, path: &Path) -> Result<bool> {
        let staging = self.ensure_staging()?;
        let holder = tempfile::Builder::new()
            .prefix(DETACHED_PREFIX)
            .tempdir_in(&staging)
            .map_err(|e| Error::io(e, &staging, "create_temp_dir"))?;
        let target = holder.path().join("tree");
        match fs::rename(path, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                holder
                    .close()
                    .map_err(|e| Error::io(e, &staging, "remove_dir_all"))?;
                return Ok(false);
            }
            Err(e) => return Err(Error::io(e, path, "rename")),
        }
        let detached = holder.path().to_path_buf();
        holder
            .close()
            .map_err(|e| Error::io(e, detached, "remove_dir_all"))?;
        Ok(true)
    }

    fn persist(&self, input_key: &InputKey, dest: &Path, bytes: &[u8]) -> Result<()> {
        let staging = self.ensure_staging()?;
        atomic::write_atomic(&staging, dest, bytes)
            .map_err(|e| vanished_as_not_found(e, input_key))
    }
}

impl Cache for DiskCache {
    fn exists(&self, input_key: &InputKey) -> Result<bool> {
        let record = match self.read_record(input_key) {
            Ok(record) => record,
            Err(e) if e.is_not_found() || e.is_corruption() => return Ok(false),
            Err(e) => return Err(e),
        };
        let path = self.layout.output_path(input_key);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file() && meta.len() == record.output.size),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(e, &path, "metadata")),
        }
    }

    fn list(&self, function_key: &FunctionKey) -> Result<Vec<InputKey>> {
        let dir = self.layout.inputs_dir(function_key);
        let mut keys = Vec::new();
        for name in read_dir_names(&dir)? {
            let Some(input_id) = decode_component(&name) else {
                continue;
            };
            let Ok(key) = function_key.input(input_id) else {
                continue;
            };
            if self.exists(&key)? {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn evict(&self, input_key: &InputKey) -> Result<()> {
        if self.detach(&self.layout.entry_dir(input_key))? {
            debug!(key = %input_key, "Evicted cache entry");
        }
        Ok(())
    }

    fn clear(&self, function_key: &FunctionKey) -> Result<()> {
        if self.detach(&self.layout.function_dir(function_key))? {
            debug!(function = %function_key, "Cleared function namespace");
        }
        Ok(())
    }

    fn adopt(&self, from: &FunctionKey, to: &FunctionKey) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let from_dir = self.layout.function_dir(from);
        let to_dir = self.layout.function_dir(to);
        if !from_dir.exists() {
            return Ok(());
        }

        // Whole-namespace move when the target has nothing yet
        if !to_dir.exists() {
            let functions = self.layout.functions_dir();
            fs::create_dir_all(&functions)
                .map_err(|e| Error::io(e, &functions, "create_dir_all"))?;
            match fs::rename(&from_dir, &to_dir) {
                Ok(()) => {
                    debug!(%from, %to, "Adopted function namespace");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    trace!(%from, %to, error = %e, "Namespace rename refused, moving entries");
                }
            }
        }

        let to_inputs = self.layout.inputs_dir(to);
        fs::create_dir_all(&to_inputs).map_err(|e| Error::io(e, &to_inputs, "create_dir_all"))?;
        let mut moved = 0usize;
        for key in self.list(from)? {
            let target = key.with_function(to.clone());
            self.evict(&target)?;
            let src = self.layout.entry_dir(&key);
            let dst = self.layout.entry_dir(&target);
            match fs::rename(&src, &dst) {
                Ok(()) => moved += 1,
                Err(e) if e.kind() == ErrorKind::NotFound && !src.exists() => {
                    trace!(key = %key, "Entry vanished during adopt");
                }
                Err(e) => return Err(Error::io(e, &dst, "rename")),
            }
        }
        self.detach(&from_dir)?;
        debug!(%from, %to, moved, "Adopted entries");
        Ok(())
    }

    fn read_output(&self, input_key: &InputKey) -> Result<Vec<u8>> {
        let before = self.read_record(input_key)?;
        let path = self.layout.output_path(input_key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(e, &path, "read")),
        };

        // The record must be unchanged across the byte load, otherwise the
        // entry was evicted or rewritten underneath us
        let after = self.read_record(input_key)?;
        if after != before {
            return Err(Error::not_found(input_key.to_string()));
        }

        let Some(bytes) = bytes else {
            return Err(Error::corruption(
                input_key.to_string(),
                "record references a missing output",
            ));
        };
        let digest = OutputDigest::of(&bytes);
        if digest.size != before.output.size {
            return Err(Error::corruption(
                input_key.to_string(),
                format!(
                    "output is {} bytes, record says {}",
                    digest.size, before.output.size
                ),
            ));
        }
        if digest.sha256 != before.output.sha256 {
            return Err(Error::corruption(
                input_key.to_string(),
                "output hash does not match record",
            ));
        }
        trace!(key = %input_key, size = digest.size, "Cache hit");
        Ok(bytes)
    }

    fn write_output(&self, output: &[u8], input_key: &InputKey) -> Result<()> {
        let dir = self.layout.entry_dir(input_key);
        fs::create_dir_all(&dir).map_err(|e| {
            vanished_as_not_found(Error::io(e, &dir, "create_dir_all"), input_key)
        })?;
        let staging = self.ensure_staging()?;
        let mut file = AtomicFile::create(&staging, self.layout.output_path(input_key))?;
        file.write_all(output)
            .map_err(|e| Error::io(e, file.temp_path(), "write"))?;
        file.commit_new().map_err(|e| match e {
            Error::Io { ref source, .. } if source.kind() == ErrorKind::AlreadyExists => {
                Error::conflict(input_key.to_string())
            }
            other => vanished_as_not_found(other, input_key),
        })?;
        trace!(key = %input_key, size = output.len(), "Wrote output");
        Ok(())
    }

    fn load_metadata(&self, input_key: &InputKey) -> Result<Metadata> {
        self.read_record(input_key).map(|record| record.metadata)
    }

    fn dump_metadata(&self, metadata: &Metadata, input_key: &InputKey) -> Result<()> {
        let output_path = self.layout.output_path(input_key);
        let file = match fs::File::open(&output_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(input_key.to_string()));
            }
            Err(e) => return Err(Error::io(e, &output_path, "open")),
        };
        let digest = OutputDigest::of_reader(BufReader::new(file))
            .map_err(|e| Error::io(e, &output_path, "read"))?;

        let record = EntryRecord::new(digest, metadata.clone());
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::serialization(format!("Failed to serialize metadata: {e}")))?;
        self.persist(input_key, &self.layout.metadata_path(input_key), &json)?;
        debug!(key = %input_key, size = record.output.size, "Committed cache entry");
        Ok(())
    }

    fn get_output_path(&self, input_key: &InputKey) -> Option<PathBuf> {
        Some(self.layout.output_path(input_key))
    }

    fn update_last_accessed(&self, input_key: &InputKey) -> Result<()> {
        let _lock = self.lock_access(input_key)?;
        let metadata_path = self.layout.metadata_path(input_key);
        match fs::metadata(&metadata_path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found(input_key.to_string()));
            }
            Err(e) => return Err(Error::io(e, &metadata_path, "metadata")),
        }

        let previous = match self.get_last_accessed(input_key) {
            Ok(previous) => previous,
            Err(e) if e.is_corruption() => {
                warn!(key = %input_key, "Replacing unreadable last-accessed timestamp");
                None
            }
            Err(e) => return Err(e),
        };
        let stamp = next_access(previous, Utc::now());
        let text = stamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.persist(input_key, &self.layout.accessed_path(input_key), text.as_bytes())
    }

    fn get_last_accessed(&self, input_key: &InputKey) -> Result<Option<DateTime<Utc>>> {
        let path = self.layout.accessed_path(input_key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        DateTime::parse_from_rfc3339(text.trim())
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| {
                Error::corruption(
                    input_key.to_string(),
                    format!("unreadable last-accessed timestamp: {e}"),
                )
            })
    }

    /// Store an output, replacing any previous entry for the key
    ///
    /// Same effect as the composed default, but the entry directory is
    /// assembled in staging and published with one rename, so the record can
    /// never be paired with another writer's bytes. The previous entry is
    /// evicted right before publishing.
    fn write(&self, output: &[u8], metadata: &Metadata, input_key: &InputKey) -> Result<()> {
        let staging = self.ensure_staging()?;
        let holder = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .tempdir_in(&staging)
            .map_err(|e| Error::io(e, &staging, "create_temp_dir"))?;
        let staged = holder.path().join("entry");
        fs::create_dir(&staged).map_err(|e| Error::io(e, &staged, "create_dir"))?;

        let record = EntryRecord::new(OutputDigest::of(output), metadata.clone());
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::serialization(format!("Failed to serialize metadata: {e}")))?;
        atomic::write_atomic(holder.path(), &staged.join(OUTPUT_FILE), output)?;
        atomic::write_atomic(holder.path(), &staged.join(METADATA_FILE), &json)?;

        let inputs = self.layout.inputs_dir(input_key.function_key());
        fs::create_dir_all(&inputs).map_err(|e| {
            vanished_as_not_found(Error::io(e, &inputs, "create_dir_all"), input_key)
        })?;
        let dest = self.layout.entry_dir(input_key);

        // Held until published: the new stamp must not undercut the old entry's
        let _lock = self.lock_access(input_key)?;
        let previous = self.get_last_accessed(input_key).ok().flatten();
        let stamp =
            next_access(previous, Utc::now()).to_rfc3339_opts(SecondsFormat::Nanos, true);
        atomic::write_atomic(holder.path(), &staged.join(ACCESSED_FILE), stamp.as_bytes())?;
        self.evict(input_key)?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match fs::rename(&staged, &dest) {
                Ok(()) => break,
                // Another writer published first; replace its entry
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty
                    ) =>
                {
                    if attempts >= PUBLISH_ATTEMPTS {
                        return Err(Error::conflict(input_key.to_string()));
                    }
                    trace!(key = %input_key, attempts, "Entry republished concurrently");
                    self.evict(input_key)?;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::not_found(input_key.to_string()));
                }
                Err(e) => return Err(Error::io(e, &dest, "rename")),
            }
        }
        let leftover = holder.path().to_path_buf();
        holder
            .close()
            .map_err(|e| Error::io(e, leftover, "remove_dir_all"))?;
        debug!(key = %input_key, size = output.len(), "Committed cache entry");
        Ok(())
    }
}

/// File names in `dir`, skipping hidden and non-UTF-8 names; empty if `dir` is missing
fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(e, dir, "read_dir")),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(e, dir, "read_dir_entry"))?;
        if let Some(name) = entry.file_name().to_str()
            && !name.starts_with(TEMP_PREFIX)
            && !name.starts_with('.')
        {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// A rename that failed because the entry directory disappeared means the
/// entry was evicted concurrently
fn vanished_as_not_found(err: Error, input_key: &InputKey) -> Error {
    match err {
        Error::Io { ref source, .. } if source.kind() == ErrorKind::NotFound => {
            Error::not_found(input_key.to_string())
        }
        other => other,
    }
}
