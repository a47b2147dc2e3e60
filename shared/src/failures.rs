//! Permanent-failure reporting
//!
//! Records from import batches that ran out of attempts. Each failure is
//! logged at error level with the full record content; when a failed-items
//! path is configured the records are also appended to it as JSON lines so
//! the file can be fed straight back into an import.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::errors::Result;
use crate::models::PermanentFailure;

#[derive(Debug)]
pub struct FailureLog {
    file: Option<(PathBuf, Mutex<File>)>,
    batches: AtomicU64,
    records: AtomicU64,
}

impl FailureLog {
    /// A log that only reports through tracing
    pub fn log_only() -> Self {
        Self {
            file: None,
            batches: AtomicU64::new(0),
            records: AtomicU64::new(0),
        }
    }

    /// Open the log, appending to `path` when given
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let mut log = Self::log_only();
        if let Some(path) = path {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            log.file = Some((path.to_path_buf(), Mutex::new(file)));
        }
        Ok(log)
    }

    pub async fn report(&self, failure: &PermanentFailure) -> Result<()> {
        let content = serde_json::to_string(&failure.records)?;
        error!(
            worker = failure.worker,
            sequence = failure.sequence,
            attempts = failure.attempts,
            records = failure.records.len(),
            reason = %failure.reason,
            items = %content,
            "Permanent failure, records were not written"
        );
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(failure.records.len() as u64, Ordering::Relaxed);

        if let Some((_, file)) = &self.file {
            let mut body = Vec::new();
            for record in &failure.records {
                serde_json::to_writer(&mut body, record)?;
                body.push(b'\n');
            }
            let mut file = file.lock().await;
            file.write_all(&body).await?;
            file.flush().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    /// Batches reported so far
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Records reported so far
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}
