//! Exclusive per-service rotation lock
//!
//! Everything a rotation touches (state directory, configuration file,
//! backups) belongs to the managed service, so the lock is named after the
//! service unit rather than the domain. `<lock_dir>/<unit>.lock` is held with a non-blocking exclusive file lock
//! for the lifetime of the guard. The lock is released when the guard is
//! dropped or the process exits; the file itself is left behind.

use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::RotationError;

pub struct RotationLock {
    file: File,
    path: PathBuf,
}

impl fmt::Debug for RotationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationLock").field("path", &self.path).finish()
    }
}

impl RotationLock {
    pub fn acquire(lock_dir: &Path, unit: &str) -> Result<Self, RotationError> {
        fs::create_dir_all(lock_dir).map_err(|e| {
            RotationError::Validation(format!(
                "cannot create lock directory {}: {}",
                lock_dir.display(),
                e
            ))
        })?;

        let path = lock_dir.join(format!("{}.lock", unit));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                RotationError::Validation(format!("cannot open lock file {}: {}", path.display(), e))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if is_contended(&e) => Err(RotationError::Validation(format!(
                "another rotation or restore of {} is already in progress ({})",
                unit,
                path.display()
            ))),
            Err(e) => Err(RotationError::Validation(format!(
                "cannot lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RotationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
