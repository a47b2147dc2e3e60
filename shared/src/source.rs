//! Import sources and the loader that feeds the work queue
//!
//! A source is a local file, a local directory searched recursively for
//! `.json` files, or an `s3://bucket/prefix` location. The [`Loader`] streams
//! every file line by line, checks that each line is an object carrying the
//! table's key attributes, groups records into batches and pushes them onto
//! the [`ImportQueue`]. Because the queue's fresh lane is bounded, the loader
//! never runs more than a few batches ahead of the workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::config::Location;
use crate::errors::{Error, Result};
use crate::models::{KeySchema, Record};
use crate::queue::ImportQueue;
use crate::retry::Supervisor;
use crate::storage::{LineReader, ObjectStore};

const JSON_EXTENSION: &str = "json";

/// Worker id the loader reports under in retry logs
const LOADER_ID: usize = usize::MAX;

/// One file of an import source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFile {
    Local(PathBuf),
    /// Object key within the source bucket
    Object(String),
}

/// The resolved list of files to import
pub struct Source {
    files: Vec<SourceFile>,
    objects: Option<Arc<dyn ObjectStore>>,
    supervisor: Supervisor,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("files", &self.files).finish()
    }
}

impl Source {
    /// Resolve a location into its files
    ///
    /// An S3 location needs an object store for its bucket. A location that
    /// resolves to no files is a configuration error. Listing and opening
    /// objects go through `supervisor`.
    pub async fn discover(
        location: &Location,
        objects: Option<Arc<dyn ObjectStore>>,
        supervisor: &Supervisor,
    ) -> Result<Self> {
        let files = match location {
            Location::Local(path) => discover_local(path).await?,
            Location::S3(uri) => {
                let store = objects.as_ref().ok_or_else(|| {
                    Error::Validation(format!("no object store configured for bucket {}", uri.bucket))
                })?;
                let mut keys: Vec<String> = supervisor
                    .run("list_source", LOADER_ID, || store.list(&uri.prefix))
                    .await?
                    .into_iter()
                    .filter(|key| key.ends_with(JSON_EXTENSION))
                    .collect();
                keys.sort();
                keys.into_iter().map(SourceFile::Object).collect()
            }
        };

        if files.is_empty() {
            return Err(Error::Validation(format!("no .json files found in {}", describe(location))));
        }
        info!(files = files.len(), source = %describe(location), "Discovered import source");
        Ok(Self {
            files,
            objects,
            supervisor: supervisor.clone(),
        })
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    fn name(&self, file: &SourceFile) -> String {
        match (file, &self.objects) {
            (SourceFile::Local(path), _) => path.display().to_string(),
            (SourceFile::Object(key), Some(store)) => store.uri(key),
            (SourceFile::Object(key), None) => key.clone(),
        }
    }

    async fn open(&self, file: &SourceFile) -> Result<LineReader> {
        match file {
            SourceFile::Local(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::pin(BufReader::new(file)))
            }
            SourceFile::Object(key) => match &self.objects {
                Some(store) => {
                    self.supervisor
                        .run("open_source", LOADER_ID, || store.get(key))
                        .await
                }
                None => Err(Error::Internal(format!("no object store for {}", key))),
            },
        }
    }
}

fn describe(location: &Location) -> String {
    match location {
        Location::Local(path) => path.display().to_string(),
        Location::S3(uri) => format!("{}{}/{}", crate::storage::S3Uri::SCHEME, uri.bucket, uri.prefix),
    }
}

/// Walk a directory tree for `.json` files; a plain file is taken as is
async fn discover_local(root: &Path) -> Result<Vec<SourceFile>> {
    let metadata = tokio::fs::metadata(root)
        .await
        .map_err(|e| Error::Validation(format!("cannot read source {}: {}", root.display(), e)))?;
    if metadata.is_file() {
        return Ok(vec![SourceFile::Local(root.to_path_buf())]);
    }

    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == JSON_EXTENSION) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found.into_iter().map(SourceFile::Local).collect())
}

/// Totals from one loader run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub files: usize,
    pub records: u64,
    pub batches: u64,
}

/// Streams source files into the import queue
pub struct Loader {
    source: Source,
    key_schema: KeySchema,
    queue: Arc<ImportQueue>,
    batch_size: usize,
}

impl Loader {
    pub fn new(source: Source, key_schema: KeySchema, queue: Arc<ImportQueue>, batch_size: usize) -> Self {
        Self {
            source,
            key_schema,
            queue,
            batch_size: batch_size.max(1),
        }
    }

    /// Load every file, then close the queue
    pub async fn run(self) -> Result<LoadStats> {
        let mut stats = LoadStats::default();
        let mut batch: Vec<Record> = Vec::with_capacity(self.batch_size);

        for file in self.source.files() {
            let name = self.source.name(file);
            let mut lines = self.source.open(file).await?.lines();
            let mut line_number = 0u64;
            let mut file_records = 0u64;

            while let Some(line) = lines.next_line().await? {
                line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let record = self.parse(&line, &name, line_number)?;
                batch.push(record);
                file_records += 1;

                if batch.len() >= self.batch_size {
                    self.enqueue(&mut batch, &mut stats).await?;
                }
            }

            info!(file = %name, records = file_records, "Loaded source file");
            stats.files += 1;
            stats.records += file_records;
        }

        if !batch.is_empty() {
            self.enqueue(&mut batch, &mut stats).await?;
        }
        self.queue.close();
        info!(files = stats.files, records = stats.records, batches = stats.batches, "Loader finished");
        Ok(stats)
    }

    fn parse(&self, line: &str, name: &str, line_number: u64) -> Result<Record> {
        let malformed = |reason: String| Error::MalformedSource {
            location: format!("{}:{}", name, line_number),
            reason,
        };
        let record = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(record)) => record,
            Ok(_) => return Err(malformed("line is not a JSON object".into())),
            Err(e) => return Err(malformed(e.to_string())),
        };
        self.key_schema
            .check(&record)
            .map_err(|_| malformed(format!("missing key attribute(s) {}", self.key_names())))?;
        Ok(record)
    }

    fn key_names(&self) -> String {
        self.key_schema.attributes().collect::<Vec<_>>().join(", ")
    }

    async fn enqueue(&self, batch: &mut Vec<Record>, stats: &mut LoadStats) -> Result<()> {
        let records = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let size = records.len();
        let sequence = self.queue.push(records).await?;
        debug!(sequence, records = size, "Enqueued batch");
        stats.batches += 1;
        Ok(())
    }
}
