//! Process-wide run lock.
//!
//! An advisory lock on a file in the work directory. The lock belongs to the
//! open file handle, so it is released when the guard drops and also when
//! the process dies without unwinding.

use chrono::{SecondsFormat, Utc};
use std::{
    fs::{self, File, OpenOptions, TryLockError},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::warn;

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock, or return `None` when another run holds it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(err)) => return Err(err),
        }

        file.set_len(0)?;
        writeln!(
            file,
            "{{\"pid\":{},\"created\":\"{}\"}}",
            std::process::id(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        )?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
