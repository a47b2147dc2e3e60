//! Export output rotation and upload
//!
//! Each export worker owns one [`WorkerOutput`] that buffers JSON lines in
//! memory. Once the buffer reaches the size threshold it is sealed, named
//! `{table}-{worker:04}-{file:04}.json`, and handed to the sink before a new
//! buffer is opened. Peak memory is therefore about `workers × max file size`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::errors::Result;
use crate::models::Record;
use crate::retry::Supervisor;
use crate::storage::ObjectStore;

/// Where sealed export files go
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Write one sealed file in full
    async fn put(&self, name: &str, body: &[u8]) -> Result<()>;

    /// Human-readable location of a file, for logs
    fn location(&self, name: &str) -> String;
}

/// Writes files into a local directory
#[derive(Debug, Clone)]
pub struct LocalSink {
    dir: PathBuf,
}

impl LocalSink {
    /// Create the sink, creating the directory when missing
    pub async fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl OutputSink for LocalSink {
    async fn put(&self, name: &str, body: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(name))
            .await?;
        file.write_all(body).await?;
        file.flush().await?;
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        self.dir.join(name).display().to_string()
    }
}

/// Uploads files under a key prefix of an object store
pub struct ObjectSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { store, prefix }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl OutputSink for ObjectSink {
    async fn put(&self, name: &str, body: &[u8]) -> Result<()> {
        self.store.put(&self.key(name), body.to_vec()).await
    }

    fn location(&self, name: &str) -> String {
        self.store.uri(&self.key(name))
    }
}

/// Output file name for a worker's n-th file
pub fn file_name(table: &str, worker: usize, file_number: u32) -> String {
    format!("{}-{:04}-{:04}.json", table, worker, file_number)
}

/// Hands out per-worker outputs sharing one sink
#[derive(Clone)]
pub struct OutputRotator {
    table: String,
    max_file_bytes: usize,
    sink: Arc<dyn OutputSink>,
    supervisor: Supervisor,
}

impl OutputRotator {
    pub fn new(
        table: impl Into<String>,
        max_file_bytes: usize,
        sink: Arc<dyn OutputSink>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            table: table.into(),
            max_file_bytes: max_file_bytes.max(1),
            sink,
            supervisor,
        }
    }

    /// Open the output for one worker
    pub fn open(&self, worker: usize) -> WorkerOutput {
        WorkerOutput {
            rotator: self.clone(),
            worker,
            file_number: 0,
            buffer: Vec::new(),
            files_written: 0,
            bytes_written: 0,
        }
    }
}

/// One worker's growing output file
pub struct WorkerOutput {
    rotator: OutputRotator,
    worker: usize,
    file_number: u32,
    buffer: Vec<u8>,
    files_written: u32,
    bytes_written: u64,
}

impl WorkerOutput {
    /// Append records as JSON lines, rotating at the size threshold
    ///
    /// A file is sealed as soon as it reaches the threshold, and a line that
    /// would push a non-empty file past it goes to the next file instead.
    pub async fn append(&mut self, records: &[Record]) -> Result<()> {
        let max = self.rotator.max_file_bytes;
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');

            if !self.buffer.is_empty() && self.buffer.len() + line.len() > max {
                self.seal().await?;
            }
            self.buffer.extend_from_slice(&line);
            if self.buffer.len() >= max {
                self.seal().await?;
            }
        }
        Ok(())
    }

    /// Flush whatever is buffered, regardless of size
    pub async fn finish(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.seal().await?;
        }
        Ok(())
    }

    async fn seal(&mut self) -> Result<()> {
        let name = file_name(&self.rotator.table, self.worker, self.file_number);
        let body = std::mem::take(&mut self.buffer);
        let sink = &self.rotator.sink;

        self.rotator
            .supervisor
            .run("flush", self.worker, || sink.put(&name, &body))
            .await?;

        info!(
            worker = self.worker,
            file = %sink.location(&name),
            bytes = body.len(),
            "Sealed output file"
        );
        self.files_written += 1;
        self.bytes_written += body.len() as u64;
        self.file_number += 1;
        Ok(())
    }

    /// Bytes waiting in the open buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
