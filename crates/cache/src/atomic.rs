//! Write-to-temp-then-rename file persistence
//!
//! An [`AtomicFile`] is a temporary file in a staging directory on the same
//! filesystem as its destination. Readers of the destination see either the
//! previous complete file or the new complete file. Dropping an uncommitted
//! `AtomicFile` deletes the temporary file.

use crate::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Prefix of every temporary file created in a staging directory
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

/// A pending file that becomes visible at `dest` only on [`AtomicFile::commit`]
#[derive(Debug)]
pub struct AtomicFile {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl AtomicFile {
    /// Create a temporary file in `staging` destined for `dest`
    ///
    /// `staging` must be on the same filesystem as `dest` for the final
    /// rename to be atomic.
    pub fn create(staging: &Path, dest: impl Into<PathBuf>) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(staging)
            .map_err(|e| Error::io(e, staging, "create_temp"))?;
        Ok(Self {
            temp,
            dest: dest.into(),
        })
    }

    /// Path of the temporary file while uncommitted
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Final destination
    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Flush to stable storage and rename into place
    pub fn commit(mut self) -> Result<()> {
        self.sync()?;
        // On failure the PersistError hands the temp file back and dropping it deletes it
        self.temp
            .persist(&self.dest)
            .map_err(|e| Error::io(e.error, &self.dest, "rename"))?;
        Ok(())
    }

    /// Like [`AtomicFile::commit`] but fails if `dest` already exists
    ///
    /// The check and the rename are one atomic step.
    pub fn commit_new(mut self) -> Result<()> {
        self.sync()?;
        self.temp
            .persist_noclobber(&self.dest)
            .map_err(|e| Error::io(e.error, &self.dest, "rename"))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.temp
            .flush()
            .map_err(|e| Error::io(e, self.temp.path(), "flush"))?;
        self.temp
            .as_file()
            .sync_all()
            .map_err(|e| Error::io(e, self.temp.path(), "sync"))
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.temp.flush()
    }
}

/// Persist `bytes` at `dest` atomically through `staging`
pub fn write_atomic(staging: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = AtomicFile::create(staging, dest)?;
    file.write_all(bytes)
        .map_err(|e| Error::io(e, file.temp_path(), "write"))?;
    file.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out.bin");

        write_atomic(tmp.path(), &dest, b"payload").unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        // Only the destination remains
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out.bin");

        write_atomic(tmp.path(), &dest, b"first version").unwrap();
        write_atomic(tmp.path(), &dest, b"second").unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
    }

    #[test]
    fn test_uncommitted_file_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let dest = tmp.path().join("out.bin");

        let temp_path = {
            let mut file = AtomicFile::create(&staging, &dest).unwrap();
            file.write_all(b"never committed").unwrap();
            file.temp_path().to_path_buf()
        };

        assert!(!temp_path.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn test_commit_into_missing_directory_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("missing").join("out.bin");

        let err = write_atomic(tmp.path(), &dest, b"x").unwrap_err();
        assert!(matches!(err, Error::Io { ref operation, .. } if operation == "rename"));
        // Temp file was cleaned up
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_commit_new_refuses_to_replace() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out.bin");
        write_atomic(tmp.path(), &dest, b"first").unwrap();

        let mut file = AtomicFile::create(tmp.path(), &dest).unwrap();
        file.write_all(b"second").unwrap();
        let err = file.commit_new().unwrap_err();

        assert!(matches!(
            err,
            Error::Io { ref source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists
        ));
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_temp_files_use_hidden_prefix() {
        let tmp = TempDir::new().unwrap();
        let file = AtomicFile::create(tmp.path(), tmp.path().join("x")).unwrap();
        let name = file.temp_path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(TEMP_PREFIX));
        assert_eq!(file.dest(), tmp.path().join("x"));
    }
}
