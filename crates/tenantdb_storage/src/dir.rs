//! Database directory layout and locking.
//!
//! ```text
//! <database path>/
//! ├─ LOCK            # Advisory lock, one environment per directory
//! └─ journal.log     # Commit journal
//! ```

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";

/// An exclusively locked database directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates the directory at `path` and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the lock,
    /// or an I/O error.
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.display().to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal file path.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Returns true if `path` holds a database journal.
    #[must_use]
    pub fn exists(path: &Path) -> bool {
        path.join(JOURNAL_FILE).is_file()
    }

    /// Removes every file of the database stored at `path`.
    ///
    /// A missing directory is not an error. Fails with
    /// [`StorageError::Locked`] while an environment still holds it open.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked or cannot be removed.
    pub fn delete_files(path: &Path) -> StorageResult<()> {
        if !path.exists() {
            return Ok(());
        }
        {
            // Taking the lock proves nobody else has the directory open.
            let _dir = Self::open(path)?;
        }
        fs::remove_dir_all(path)?;
        Ok(())
    }
}
