//! Exclusive-create lockfiles.
//!
//! The stack's locking protocol lives entirely on the filesystem: whoever
//! creates `<file>.lock` with `O_CREAT|O_EXCL` holds the lock, and the
//! lockfile doubles as the staging area for the new `tables.list`, committed
//! by renaming it onto its destination.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Holds one exclusively-created lockfile. Dropping the guard removes the
/// file unless it was committed away.
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
    file: Option<File>,
    defused: bool,
}

impl LockFile {
    /// Creates `path` exclusively. An already existing lockfile maps to
    /// `Error::LockFailure`; the caller may retry after reloading.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<LockFile> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => Ok(LockFile {
                path,
                file: Some(file),
                defused: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::LockFailure),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .as_mut()
            .expect("lockfile is open")
            .write_all(data)?;
        Ok(())
    }

    /// Closes the lockfile and renames it onto `dest`, atomically
    /// committing its contents.
    pub fn commit(mut self, dest: &Path) -> Result<()> {
        let file = self.file.take().expect("lockfile is open");
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.path, dest)?;
        self.defused = true;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.file.take();
        if !self.defused {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// The lockfile path for `path`: the same name with ".lock" appended.
pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_contend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.list.lock");

        let lock = LockFile::acquire(&path).expect("first acquire");
        assert!(path.exists());
        assert_eq!(LockFile::acquire(&path).unwrap_err(), Error::LockFailure);

        drop(lock);
        assert!(!path.exists());
        let _relock = LockFile::acquire(&path).expect("acquire after release");
    }

    #[test]
    fn test_commit_renames_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tables.list");
        let path = lock_path(&dest);

        let mut lock = LockFile::acquire(&path).unwrap();
        lock.write_all(b"a.ref\nb.ref").unwrap();
        lock.commit(&dest).unwrap();

        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "a.ref\nb.ref");
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path(Path::new("/x/tables.list")),
            PathBuf::from("/x/tables.list.lock")
        );
    }
}
