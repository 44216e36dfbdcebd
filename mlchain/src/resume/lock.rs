//! Exclusive ownership of a resume store.

use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::ConcurrentRunError;
use crate::utils::iso_timestamp;

/// An advisory lock held for the lifetime of a run.
///
/// The lock file sits next to the execution log and is locked exclusively
/// through the operating system. The kernel releases the lock when the
/// holder exits, so a run that crashed never blocks the next one. A second
/// run against a log that is still held fails with [`ConcurrentRunError`]
/// instead of interleaving records.
///
/// The file itself is left in place; its contents only describe the last
/// holder.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// The lock path for an execution log.
    #[must_use]
    pub fn path_for(log_path: &Path) -> PathBuf {
        let mut name = log_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquires the lock, recording the holder's pid and run id.
    pub fn acquire(path: impl Into<PathBuf>, run_id: Uuid) -> Result<Self, ConcurrentRunError> {
        let path = path.into();
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ConcurrentRunError::new(&path, Some(format!("lock file unusable: {e}"))))?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                return Err(ConcurrentRunError::new(path, holder));
            }
            return Err(ConcurrentRunError::new(path, Some(format!("lock file unusable: {e}"))));
        }

        let holder = serde_json::json!({
            "pid": std::process::id(),
            "run_id": run_id.to_string(),
            "acquired_at": iso_timestamp(),
        });
        // The holder record is informational; the OS lock is what excludes.
        let _ = file
            .set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(file, "{holder}"))
            .and_then(|()| file.sync_all());

        tracing::debug!(lock = %path.display(), %run_id, "Acquired run lock");
        Ok(Self { path, file })
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(lock = %self.path.display(), "Released run lock");
    }
}
