//! Export mode
//!
//! Each worker owns one or more scan segments and walks them page by page:
//!
//! ```text
//! SCANNING -> (PAGE_RECEIVED -> BUFFERING)* -> DONE
//! ```
//!
//! Before every scan call the worker reserves read capacity with the
//! governor, and settles the reservation with the consumed units the table
//! reports. Records go to the worker's [`WorkerOutput`], which rotates files
//! at the size threshold and flushes the remainder once the segments are
//! exhausted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{ExportConfig, Location};
use crate::dynamo::TableStore;
use crate::errors::{Error, Result};
use crate::governor::CapacityGovernor;
use crate::models::{CapacityKind, Record, ScanPage, Segment};
use crate::output::{LocalSink, ObjectSink, OutputRotator, OutputSink, WorkerOutput};
use crate::pool::WorkerPool;
use crate::preflight::check_table;
use crate::retry::Supervisor;
use crate::segment::SegmentPlanner;
use crate::storage::ObjectStore;

/// Read units of a full 1 MB scan page, eventually consistent
pub const FULL_PAGE_READ_UNITS: f64 = 128.0;

/// Smallest charge a scan call can incur
const MIN_PAGE_READ_UNITS: f64 = 0.5;

const BYTES_PER_READ_UNIT: f64 = 4096.0;

/// Read units a page of records costs, eventually consistent
fn page_read_units(records: &[Record]) -> f64 {
    let bytes: usize = records
        .iter()
        .map(|record| serde_json::to_vec(record).map_or(0, |body| body.len()))
        .sum();
    ((bytes as f64 / BYTES_PER_READ_UNIT).ceil() * MIN_PAGE_READ_UNITS).max(MIN_PAGE_READ_UNITS)
}

/// Totals for one export worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportStats {
    pub worker: usize,
    pub segments: usize,
    pub pages: u64,
    pub records: u64,
    pub files: u32,
    pub bytes: u64,
    pub read_units: f64,
}

enum ScanState {
    Scanning { start_key: Option<Record> },
    PageReceived(ScanPage),
    Done,
}

/// One export worker
pub struct ExportWorker {
    id: usize,
    segments: Vec<Segment>,
    store: Arc<dyn TableStore>,
    governor: Arc<CapacityGovernor>,
    supervisor: Supervisor,
    output: WorkerOutput,
    /// Learned from the previous page
    units_per_item: Option<f64>,
    last_page_units: f64,
    stats: ExportStats,
}

impl ExportWorker {
    pub fn new(
        id: usize,
        segments: Vec<Segment>,
        store: Arc<dyn TableStore>,
        governor: Arc<CapacityGovernor>,
        supervisor: Supervisor,
        output: WorkerOutput,
    ) -> Self {
        Self {
            id,
            stats: ExportStats {
                worker: id,
                segments: segments.len(),
                ..ExportStats::default()
            },
            segments,
            store,
            governor,
            supervisor,
            output,
            units_per_item: None,
            last_page_units: FULL_PAGE_READ_UNITS,
        }
    }

    /// Scan every assigned segment to the end, then flush
    pub async fn run(mut self) -> Result<ExportStats> {
        let segments = std::mem::take(&mut self.segments);
        for segment in segments {
            self.scan(segment).await?;
        }
        self.output.finish().await?;

        self.stats.files = self.output.files_written();
        self.stats.bytes = self.output.bytes_written();
        info!(
            worker = self.id,
            pages = self.stats.pages,
            records = self.stats.records,
            files = self.stats.files,
            "Export worker finished"
        );
        Ok(self.stats)
    }

    async fn scan(&mut self, segment: Segment) -> Result<()> {
        info!(worker = self.id, segment = %segment, "Scanning segment");
        let mut state = ScanState::Scanning { start_key: None };
        loop {
            state = match state {
                ScanState::Scanning { start_key } => {
                    ScanState::PageReceived(self.fetch(segment, start_key.as_ref()).await?)
                }
                ScanState::PageReceived(page) => {
                    self.learn(&page);
                    // Buffering: records leave through the rotator
                    self.output.append(&page.records).await?;
                    match page.last_evaluated_key {
                        Some(key) => ScanState::Scanning { start_key: Some(key) },
                        None => ScanState::Done,
                    }
                }
                ScanState::Done => break,
            };
        }
        debug!(worker = self.id, segment = %segment, "Segment exhausted");
        Ok(())
    }

    async fn fetch(&self, segment: Segment, start_key: Option<&Record>) -> Result<ScanPage> {
        let limit = self.page_limit();
        let estimate = self.estimate(limit);
        let reservation = self.governor.acquire(CapacityKind::Read, estimate).await;

        let store = &self.store;
        let result = self
            .supervisor
            .run("scan", self.id, || store.scan_segment(segment, start_key, limit))
            .await;

        match result {
            Ok(mut page) => {
                if page.consumed_units <= 0.0 {
                    // Some endpoints omit consumed capacity
                    page.consumed_units = page_read_units(&page.records);
                }
                debug!(
                    worker = self.id,
                    segment = %segment,
                    records = page.records.len(),
                    units = page.consumed_units,
                    estimate,
                    "Received page"
                );
                self.governor.settle(reservation, page.consumed_units);
                Ok(page)
            }
            Err(err) => {
                self.governor.settle(reservation, 0.0);
                Err(err)
            }
        }
    }

    /// Shrink scan pages when one full page would not fit the budget
    fn page_limit(&self) -> Option<i32> {
        let budget = self.governor.window_budget(CapacityKind::Read)?;
        if budget >= FULL_PAGE_READ_UNITS {
            return None;
        }
        let items = match self.units_per_item {
            Some(per_item) => (budget / per_item).floor(),
            None => 1.0,
        };
        Some(items.clamp(1.0, i32::MAX as f64) as i32)
    }

    fn estimate(&self, limit: Option<i32>) -> f64 {
        match (limit, self.units_per_item) {
            (Some(limit), Some(per_item)) => per_item * f64::from(limit),
            (Some(_), None) => MIN_PAGE_READ_UNITS,
            (None, _) => self.last_page_units,
        }
    }

    fn learn(&mut self, page: &ScanPage) {
        self.stats.pages += 1;
        self.stats.records += page.records.len() as u64;
        self.stats.read_units += page.consumed_units;
        self.last_page_units = page.consumed_units.max(MIN_PAGE_READ_UNITS);
        if !page.records.is_empty() && page.consumed_units > 0.0 {
            self.units_per_item = Some(page.consumed_units / page.records.len() as f64);
        }
    }
}

/// Outcome of an export run
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub run_id: Uuid,
    pub table: String,
    pub workers: usize,
    pub segments: u32,
    pub pages: u64,
    pub records: u64,
    pub files: u32,
    pub bytes: u64,
    pub read_units: f64,
    pub retries: u64,
    pub elapsed: Duration,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exported {} records from {} in {} pages to {} files ({} bytes) using {:.1} read units, {} retries, {:.1}s",
            self.records,
            self.table,
            self.pages,
            self.files,
            self.bytes,
            self.read_units,
            self.retries,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Build the sink for an export destination
///
/// S3 destinations need an object store for the destination bucket.
pub async fn open_sink(
    destination: &Location,
    objects: Option<Arc<dyn ObjectStore>>,
) -> Result<Arc<dyn OutputSink>> {
    match destination {
        Location::Local(dir) => Ok(Arc::new(LocalSink::create(dir).await?)),
        Location::S3(uri) => {
            let store = objects.ok_or_else(|| {
                Error::Validation(format!("no object store configured for bucket {}", uri.bucket))
            })?;
            Ok(Arc::new(ObjectSink::new(store, uri.prefix.clone())))
        }
    }
}

/// Export a whole table
///
/// Runs the pre-flight checks, plans segments, starts one worker per process
/// and waits for all of them. The first worker failure stops the run.
pub async fn run_export(
    config: &ExportConfig,
    store: Arc<dyn TableStore>,
    sink: Arc<dyn OutputSink>,
) -> Result<ExportSummary> {
    config.validate()?;
    let run_id = Uuid::new_v4();
    let span = info_span!("export", run_id = %run_id, table = %config.table);
    let started = Instant::now();

    let supervisor = Supervisor::new(config.retry.clone());
    check_table(store.as_ref(), &supervisor, CapacityKind::Read, Some(config.read_capacity))
        .instrument(span.clone())
        .await?;

    let governor = Arc::new(CapacityGovernor::per_second(Some(config.read_capacity), None));
    let rotator = OutputRotator::new(config.table.clone(), config.max_file_bytes(), sink, supervisor.clone());
    let planner = SegmentPlanner::new(config.total_segments());

    span.in_scope(|| {
        info!(
            workers = config.workers,
            segments = planner.total_segments(),
            read_capacity = config.read_capacity,
            max_file_mb = config.max_file_mb,
            "Starting export"
        )
    });

    let mut pool = WorkerPool::new();
    for (id, segments) in planner.assign(config.workers).into_iter().enumerate() {
        if segments.is_empty() {
            continue;
        }
        let worker = ExportWorker::new(
            id,
            segments,
            store.clone(),
            governor.clone(),
            supervisor.clone(),
            rotator.open(id),
        );
        pool.spawn(worker.run().instrument(span.clone()));
    }
    let results = pool.join().await?;

    let summary = ExportSummary {
        run_id,
        table: config.table.clone(),
        workers: results.len(),
        segments: planner.total_segments(),
        pages: results.iter().map(|s| s.pages).sum(),
        records: results.iter().map(|s| s.records).sum(),
        files: results.iter().map(|s| s.files).sum(),
        bytes: results.iter().map(|s| s.bytes).sum(),
        read_units: governor.lifetime(CapacityKind::Read),
        retries: supervisor.retries(),
        elapsed: started.elapsed(),
    };
    span.in_scope(|| {
        info!(
            records = summary.records,
            pages = summary.pages,
            files = summary.files,
            bytes = summary.bytes,
            read_units = summary.read_units,
            retries = summary.retries,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Export complete"
        )
    });
    Ok(summary)
}
