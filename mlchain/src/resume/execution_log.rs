//! The file-backed execution log.
//!
//! The log is JSON Lines, one [`LogEntry`] per line. Records are only ever
//! appended, and each append is flushed and synced before it returns.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::{LogEntry, ResumeMode, ResumeSnapshot, ResumeStore, RunLock};
use crate::errors::{MlchainError, ResumeStoreCorruptError};

/// An execution log on disk, held exclusively for one run.
#[derive(Debug)]
pub struct FileResumeStore {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    snapshot: ResumeSnapshot,
    _lock: RunLock,
}

impl FileResumeStore {
    /// Opens the log at `path` for a run.
    ///
    /// Takes the run lock first. In [`ResumeMode::Fresh`] existing records are
    /// discarded; otherwise they are replayed into the snapshot returned by
    /// [`ResumeStore::load`]. A final record cut short by a crash is dropped
    /// with a warning and trimmed from the file.
    ///
    /// # Errors
    ///
    /// - [`MlchainError::ConcurrentRun`] if another run holds the log.
    /// - [`MlchainError::ResumeStoreCorrupt`] if a complete line is unreadable.
    /// - [`MlchainError::Io`] if the file cannot be read or opened.
    pub fn open(path: impl Into<PathBuf>, mode: ResumeMode, run_id: Uuid) -> Result<Self, MlchainError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let lock = RunLock::acquire(RunLock::path_for(&path), run_id)?;

        let (snapshot, valid_len, needs_newline) = match mode {
            ResumeMode::Fresh => (ResumeSnapshot::new(), 0, false),
            ResumeMode::ResumeIfPossible => match fs::read(&path) {
                Ok(bytes) => replay(&path, &bytes)?,
                Err(e) if e.kind() == ErrorKind::NotFound => (ResumeSnapshot::new(), 0, false),
                Err(e) => return Err(e.into()),
            },
        };

        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.set_len(valid_len)?;
        drop(file);

        let mut file = OpenOptions::new().append(true).open(&path)?;
        if needs_newline {
            file.write_all(b"\n")?;
            file.sync_all()?;
        }

        tracing::info!(
            log = %path.display(),
            ?mode,
            completed = snapshot.completed_len(),
            in_flight = snapshot.in_flight_len(),
            "Opened execution log"
        );

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            snapshot,
            _lock: lock,
        })
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replays log bytes.
///
/// Returns the snapshot, the length of the valid prefix, and whether the
/// valid prefix ends without a newline.
fn replay(path: &Path, bytes: &[u8]) -> Result<(ResumeSnapshot, u64, bool), ResumeStoreCorruptError> {
    let mut snapshot = ResumeSnapshot::new();
    let mut valid_len = 0usize;
    let mut needs_newline = false;

    for (index, line) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let terminated = line.ends_with(b"\n");
        let body = line.strip_suffix(b"\n").unwrap_or(line);
        let body = body.strip_suffix(b"\r").unwrap_or(body);

        if body.iter().all(u8::is_ascii_whitespace) {
            valid_len += line.len();
            continue;
        }

        match serde_json::from_slice::<LogEntry>(body) {
            Ok(entry) => {
                snapshot.apply(entry);
                valid_len += line.len();
                needs_newline = !terminated;
            }
            Err(e) if !terminated => {
                // Only the final line can lack a newline.
                tracing::warn!(
                    log = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Ignoring truncated final record in execution log"
                );
                break;
            }
            Err(e) => {
                return Err(ResumeStoreCorruptError::new(path, index + 1, e.to_string()));
            }
        }
    }

    Ok((snapshot, valid_len as u64, needs_newline))
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn load(&self) -> Result<ResumeSnapshot, MlchainError> {
        Ok(self.snapshot.clone())
    }

    async fn append(&self, entry: LogEntry) -> Result<(), MlchainError> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let file = Arc::clone(&self.file);

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = file.lock();
            file.write_all(&line)?;
            file.flush()?;
            file.sync_all()
        })
        .await
        .map_err(|e| MlchainError::Internal(format!("log append task failed: {e}")))??;

        tracing::trace!(stage_id = %entry.stage_id(), remote_id = %entry.remote_id(), "Appended log record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RemoteId, StageId};

    fn open(path: &Path, mode: ResumeMode) -> Result<FileResumeStore, MlchainError> {
        FileResumeStore::open(path, mode, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("execution.log");

        {
            let store = open(&path, ResumeMode::ResumeIfPossible).unwrap();
            assert!(store.load().await.unwrap().is_empty());
            store
                .record_completed(&StageId::new("source-1"), &RemoteId::new("source/1"))
                .await
                .unwrap();
            store
                .record_issued(&StageId::new("dataset-1"), &RemoteId::new("dataset/1"))
                .await
                .unwrap();
        }

        let store = open(&path, ResumeMode::ResumeIfPossible).unwrap();
        let snapshot = store.load().await.unwrap();
        assert_eq!(
            snapshot.completed(&StageId::new("source-1")),
            Some(&RemoteId::new("source/1"))
        );
        assert_eq!(
            snapshot.in_flight(&StageId::new("dataset-1")),
            Some(&RemoteId::new("dataset/1"))
        );
    }

    #[tokio::test]
    async fn test_fresh_mode_discards_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        {
            let store = open(&path, ResumeMode::ResumeIfPossible).unwrap();
            store
                .record_completed(&StageId::new("source-1"), &RemoteId::new("source/1"))
                .await
                .unwrap();
        }

        let store = open(&path, ResumeMode::Fresh).unwrap();
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_truncated_final_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        let good = serde_json::to_string(&LogEntry::completed(
            StageId::new("source-1"),
            RemoteId::new("source/1"),
        ))
        .unwrap();
        fs::write(&path, format!("{good}\n{{\"type\":\"completed\",\"stage_id\":\"da")).unwrap();

        let store = open(&path, ResumeMode::ResumeIfPossible).unwrap();
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.completed_len(), 1);

        store
            .record_completed(&StageId::new("dataset-1"), &RemoteId::new("dataset/1"))
            .await
            .unwrap();
        drop(store);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let reopened = open(&path, ResumeMode::ResumeIfPossible).unwrap();
        assert_eq!(reopened.load().await.unwrap().completed_len(), 2);
    }

    #[tokio::test]
    async fn test_unterminated_valid_final_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        let good = serde_json::to_string(&LogEntry::completed(
            StageId::new("source-1"),
            RemoteId::new("source/1"),
        ))
        .unwrap();
        fs::write(&path, &good).unwrap();

        let store = open(&path, ResumeMode::ResumeIfPossible).unwrap();
        store
            .record_completed(&StageId::new("dataset-1"), &RemoteId::new("dataset/1"))
            .await
            .unwrap();
        drop(store);

        let reopened = open(&path, ResumeMode::ResumeIfPossible).unwrap();
        assert_eq!(reopened.load().await.unwrap().completed_len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        let good = serde_json::to_string(&LogEntry::completed(
            StageId::new("source-1"),
            RemoteId::new("source/1"),
        ))
        .unwrap();
        fs::write(&path, format!("{good}\nnot json\n{good}\n")).unwrap();

        match open(&path, ResumeMode::ResumeIfPossible) {
            Err(MlchainError::ResumeStoreCorrupt(err)) => assert_eq!(err.line, 2),
            other => panic!("expected a corrupt store error, got {other:?}"),
        }
        // The failed open released its lock.
        assert!(matches!(
            open(&path, ResumeMode::ResumeIfPossible),
            Err(MlchainError::ResumeStoreCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_reopens_after_a_crashed_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        let record = serde_json::to_string(&LogEntry::completed(
            StageId::new("source-1"),
            RemoteId::new("source/1"),
        ))
        .unwrap();
        // A killed run leaves its log and lock file behind, but no lock holder.
        fs::write(&path, format!("{record}\n")).unwrap();
        fs::write(RunLock::path_for(&path), r#"{"pid":4194303,"run_id":"dead"}"#).unwrap();

        let store = open(&path, ResumeMode::ResumeIfPossible).unwrap();
        assert_eq!(
            store.load().await.unwrap().completed(&StageId::new("source-1")),
            Some(&RemoteId::new("source/1"))
        );
    }

    #[test]
    fn test_second_open_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution.log");
        let _first = open(&path, ResumeMode::ResumeIfPossible).unwrap();

        assert!(matches!(
            open(&path, ResumeMode::ResumeIfPossible),
            Err(MlchainError::ConcurrentRun(_))
        ));
    }
}
