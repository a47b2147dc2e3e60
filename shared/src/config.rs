//! Run configuration
//!
//! Plain structs the binaries fill from their command lines. The library
//! validates them before touching any AWS service, so a bad flag fails fast
//! with a validation error rather than mid-run.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use crate::errors::{Error, Result};
use crate::models::BATCH_WRITE_MAX_ITEMS;
use crate::retry::RetryPolicy;
use crate::storage::S3Uri;

/// How long import workers keep polling an empty queue before exiting
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Bounded wait for a single dequeue
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Fresh-lane batches per import worker
pub const QUEUE_BATCHES_PER_WORKER: usize = 4;

/// Write attempts per work item before it is reported as a permanent failure
pub const DEFAULT_MAX_ITEM_ATTEMPTS: u32 = 8;

/// Default output file size in MB
pub const DEFAULT_MAX_FILE_MB: u64 = 1024;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines (default)
    #[default]
    Plain,
    /// One JSON object per event
    Json,
}

/// A local path or an `s3://bucket/prefix` location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3(S3Uri),
}

impl Location {
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(Error::Validation("location must not be empty".into()));
        }
        match S3Uri::parse(value) {
            Some(uri) => Ok(Location::S3(uri?)),
            None => Ok(Location::Local(PathBuf::from(value))),
        }
    }
}

impl std::str::FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Location::parse(s)
    }
}

/// Export run settings
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub table: String,
    /// Worker tasks
    pub workers: usize,
    /// Scan segments; defaults to one per worker
    pub segments: Option<u32>,
    /// Read capacity ceiling in units per second
    pub read_capacity: u32,
    pub max_file_mb: u64,
    pub destination: Location,
    pub retry: RetryPolicy,
}

impl ExportConfig {
    pub fn new(table: impl Into<String>, destination: Location, workers: usize, read_capacity: u32) -> Self {
        Self {
            table: table.into(),
            workers,
            segments: None,
            read_capacity,
            max_file_mb: DEFAULT_MAX_FILE_MB,
            destination,
            retry: RetryPolicy::default(),
        }
    }

    pub fn total_segments(&self) -> u32 {
        self.segments.unwrap_or(self.workers as u32)
    }

    pub fn max_file_bytes(&self) -> usize {
        (self.max_file_mb.saturating_mul(BYTES_PER_MB)).min(usize::MAX as u64) as usize
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(&self.table, self.workers, &self.retry)?;
        if self.read_capacity == 0 {
            return Err(Error::Validation("read capacity must be > 0".into()));
        }
        if self.max_file_mb == 0 {
            return Err(Error::Validation("max file size must be > 0 MB".into()));
        }
        if self.segments == Some(0) {
            return Err(Error::Validation("segments must be > 0".into()));
        }
        if self.workers > u32::MAX as usize {
            return Err(Error::Validation("too many workers".into()));
        }
        Ok(())
    }
}

/// Import run settings
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub table: String,
    pub source: Location,
    pub workers: usize,
    /// Write capacity ceiling in units per second; None disables pacing
    pub write_capacity: Option<u32>,
    /// Records per work item, at most the batch-write limit
    pub batch_size: usize,
    /// Fresh-lane capacity; defaults to a few batches per worker
    pub queue_capacity: Option<usize>,
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub max_item_attempts: u32,
    /// Where permanently failed records are appended
    pub failed_items: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl ImportConfig {
    pub fn new(table: impl Into<String>, source: Location, workers: usize) -> Self {
        Self {
            table: table.into(),
            source,
            workers,
            write_capacity: None,
            batch_size: BATCH_WRITE_MAX_ITEMS,
            queue_capacity: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_item_attempts: DEFAULT_MAX_ITEM_ATTEMPTS,
            failed_items: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(self.workers * QUEUE_BATCHES_PER_WORKER)
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(&self.table, self.workers, &self.retry)?;
        if self.write_capacity == Some(0) {
            return Err(Error::Validation("write capacity must be > 0".into()));
        }
        if self.batch_size == 0 || self.batch_size > BATCH_WRITE_MAX_ITEMS {
            return Err(Error::Validation(format!(
                "batch size must be between 1 and {}",
                BATCH_WRITE_MAX_ITEMS
            )));
        }
        if self.max_item_attempts == 0 {
            return Err(Error::Validation("max item attempts must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Validation("poll interval must be > 0".into()));
        }
        Ok(())
    }
}

fn validate_common(table: &str, workers: usize, retry: &RetryPolicy) -> Result<()> {
    if table.trim().is_empty() {
        return Err(Error::Validation("table name is required".into()));
    }
    if workers == 0 {
        return Err(Error::Validation("process count must be > 0".into()));
    }
    if retry.max_attempts == 0 {
        return Err(Error::Validation("max attempts must be > 0".into()));
    }
    Ok(())
}
