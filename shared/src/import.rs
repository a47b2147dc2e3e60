//! Import mode
//!
//! A [`Loader`] streams the source into the [`ImportQueue`] while a pool of
//! [`ImportWorker`]s drains it. For every work item a worker reserves write
//! capacity, issues a batch write, and requeues whatever the table left
//! unprocessed on the retry lane with its attempt count bumped. Items that
//! run out of attempts are handed to the [`FailureLog`].
//!
//! Workers stop when the queue reports it is drained, or after seeing an
//! empty queue for the whole grace period.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::dynamo::TableStore;
use crate::errors::Result;
use crate::failures::FailureLog;
use crate::governor::CapacityGovernor;
use crate::models::{CapacityKind, KeySchema, PermanentFailure, Record, WorkItem};
use crate::pool::WorkerPool;
use crate::preflight::check_table;
use crate::queue::{ImportQueue, Pop};
use crate::retry::Supervisor;
use crate::source::{LoadStats, Loader, Source};
use crate::storage::ObjectStore;

const BYTES_PER_WRITE_UNIT: f64 = 1024.0;

/// Estimated write units for one record
pub fn write_units(record: &Record) -> f64 {
    let bytes = serde_json::to_vec(record).map_or(0, |body| body.len());
    (bytes as f64 / BYTES_PER_WRITE_UNIT).ceil().max(1.0)
}

/// Collapse records sharing a primary key, keeping the last one
///
/// The surviving record takes the position of the first occurrence.
pub fn dedupe_by_key(key_schema: &KeySchema, records: Vec<Record>) -> (Vec<Record>, usize) {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<Record> = Vec::with_capacity(records.len());
    let mut collapsed = 0;
    for record in records {
        let key = key_schema.key_of(&record);
        match positions.get(&key) {
            Some(&at) => {
                unique[at] = record;
                collapsed += 1;
            }
            None => {
                positions.insert(key, unique.len());
                unique.push(record);
            }
        }
    }
    (unique, collapsed)
}

/// State shared by every import worker of a run
pub struct ImportContext {
    pub queue: Arc<ImportQueue>,
    pub store: Arc<dyn TableStore>,
    pub governor: Arc<CapacityGovernor>,
    pub supervisor: Supervisor,
    pub failures: Arc<FailureLog>,
    pub key_schema: KeySchema,
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub max_item_attempts: u32,
}

/// Totals for one import worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportStats {
    pub worker: usize,
    /// Work items claimed, retries included
    pub items: u64,
    /// Batch-write calls
    pub batches: u64,
    pub records_written: u64,
    pub requeued: u64,
    /// Records superseded by a later record with the same key
    pub duplicates: u64,
    pub failed_records: u64,
}

pub struct ImportWorker {
    id: usize,
    ctx: Arc<ImportContext>,
    stats: ImportStats,
}

impl ImportWorker {
    /// Create a worker and register it as a consumer of the queue
    pub fn new(id: usize, ctx: Arc<ImportContext>) -> Self {
        ctx.queue.join_consumer();
        Self {
            id,
            ctx,
            stats: ImportStats {
                worker: id,
                ..ImportStats::default()
            },
        }
    }

    pub async fn run(mut self) -> Result<ImportStats> {
        let mut last_activity = Instant::now();
        loop {
            match self.ctx.queue.pop(self.ctx.poll_interval).await {
                Pop::Item(item) => {
                    self.process(item).await?;
                    last_activity = Instant::now();
                }
                Pop::Drained => {
                    debug!(worker = self.id, "Queue drained");
                    break;
                }
                Pop::Empty => {
                    let idle = last_activity.elapsed();
                    if idle >= self.ctx.grace_period {
                        info!(worker = self.id, idle_ms = idle.as_millis() as u64, "Queue empty for grace period");
                        break;
                    }
                }
            }
        }
        self.ctx.queue.leave_consumer();

        info!(
            worker = self.id,
            batches = self.stats.batches,
            records = self.stats.records_written,
            requeued = self.stats.requeued,
            "Import worker finished"
        );
        Ok(self.stats)
    }

    async fn process(&mut self, item: WorkItem) -> Result<()> {
        self.stats.items += 1;
        if item.attempts > 0 {
            let delay = self.ctx.supervisor.policy().backoff(item.attempts);
            debug!(
                worker = self.id,
                sequence = item.sequence,
                attempt = item.attempts,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retrying work item"
            );
            tokio::time::sleep(delay).await;
        }

        let (records, collapsed) = dedupe_by_key(&self.ctx.key_schema, item.records.clone());
        self.stats.duplicates += collapsed as u64;

        let estimate: f64 = records.iter().map(write_units).sum();
        let chunk_size = self
            .ctx
            .governor
            .viable_items(CapacityKind::Write, estimate, records.len());

        let mut unprocessed = Vec::new();
        for chunk in records.chunks(chunk_size) {
            unprocessed.extend(self.write(chunk).await?);
        }

        if unprocessed.is_empty() {
            self.ctx.queue.complete();
            return Ok(());
        }

        let retry = item.retry_with(unprocessed);
        if retry.attempts >= self.ctx.max_item_attempts {
            self.stats.failed_records += retry.len() as u64;
            let failure = PermanentFailure {
                sequence: retry.sequence,
                attempts: retry.attempts,
                worker: self.id,
                reason: format!("{} records still unprocessed after {} attempts", retry.len(), retry.attempts),
                records: retry.records,
                failed_at: Utc::now(),
            };
            self.ctx.failures.report(&failure).await?;
            self.ctx.queue.complete();
        } else {
            debug!(
                worker = self.id,
                sequence = retry.sequence,
                attempt = retry.attempts,
                unprocessed = retry.len(),
                "Requeueing unprocessed records"
            );
            self.stats.requeued += 1;
            self.ctx.queue.requeue(retry);
        }
        Ok(())
    }

    /// One batch write; returns the records the table did not take
    async fn write(&mut self, chunk: &[Record]) -> Result<Vec<Record>> {
        let estimate: f64 = chunk.iter().map(write_units).sum();
        let reservation = self.ctx.governor.acquire(CapacityKind::Write, estimate).await;

        let store = &self.ctx.store;
        let result = self
            .ctx
            .supervisor
            .run("batch_write", self.id, || store.batch_write(chunk))
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.ctx.governor.settle(reservation, 0.0);
                return Err(err);
            }
        };

        let written = chunk.len() - outcome.unprocessed.len();
        let consumed = if outcome.consumed_units > 0.0 {
            outcome.consumed_units
        } else {
            // Some endpoints omit consumed capacity
            estimate * written as f64 / chunk.len().max(1) as f64
        };
        self.ctx.governor.settle(reservation, consumed);
        self.stats.batches += 1;
        self.stats.records_written += written as u64;

        debug!(
            worker = self.id,
            records = chunk.len(),
            unprocessed = outcome.unprocessed.len(),
            units = consumed,
            "Batch written"
        );
        Ok(outcome.unprocessed)
    }
}

/// Outcome of an import run
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub table: String,
    pub workers: usize,
    pub files: usize,
    pub records_read: u64,
    pub records_written: u64,
    pub batches: u64,
    pub requeued: u64,
    pub duplicates: u64,
    pub failed_records: u64,
    pub write_units: f64,
    pub retries: u64,
    pub elapsed: Duration,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "imported {} of {} records into {} in {} batches using {:.1} write units, {} requeued, {} failed, {} retries, {:.1}s",
            self.records_written,
            self.records_read,
            self.table,
            self.batches,
            self.write_units,
            self.requeued,
            self.failed_records,
            self.retries,
            self.elapsed.as_secs_f64()
        )
    }
}

enum ImportTask {
    Loader(LoadStats),
    Worker(ImportStats),
}

/// Import a source into a table
///
/// `objects` must be given when the source is an S3 location.
pub async fn run_import(
    config: &ImportConfig,
    store: Arc<dyn TableStore>,
    objects: Option<Arc<dyn ObjectStore>>,
) -> Result<ImportSummary> {
    config.validate()?;
    let run_id = Uuid::new_v4();
    let span = info_span!("import", run_id = %run_id, table = %config.table);
    let started = Instant::now();

    let supervisor = Supervisor::new(config.retry.clone());
    let table = check_table(store.as_ref(), &supervisor, CapacityKind::Write, config.write_capacity)
        .instrument(span.clone())
        .await?;
    let source = Source::discover(&config.source, objects, &supervisor)
        .instrument(span.clone())
        .await?;
    let failures = Arc::new(FailureLog::open(config.failed_items.as_deref()).await?);

    let queue = Arc::new(ImportQueue::new(config.queue_capacity()));
    let ctx = Arc::new(ImportContext {
        queue: queue.clone(),
        store,
        governor: Arc::new(CapacityGovernor::per_second(None, config.write_capacity)),
        supervisor: supervisor.clone(),
        failures: failures.clone(),
        key_schema: table.key_schema.clone(),
        grace_period: config.grace_period,
        poll_interval: config.poll_interval,
        max_item_attempts: config.max_item_attempts,
    });

    span.in_scope(|| {
        info!(
            workers = config.workers,
            files = source.files().len(),
            write_capacity = ?config.write_capacity,
            queue_capacity = config.queue_capacity(),
            "Starting import"
        )
    });

    let mut pool = WorkerPool::new();
    let loader = Loader::new(source, table.key_schema, queue, config.batch_size);
    pool.spawn(
        async move { loader.run().await.map(ImportTask::Loader) }.instrument(span.clone()),
    );
    for id in 0..config.workers {
        let worker = ImportWorker::new(id, ctx.clone());
        pool.spawn(async move { worker.run().await.map(ImportTask::Worker) }.instrument(span.clone()));
    }

    let mut loaded = LoadStats::default();
    let mut workers = Vec::with_capacity(config.workers);
    for task in pool.join().await? {
        match task {
            ImportTask::Loader(stats) => loaded = stats,
            ImportTask::Worker(stats) => workers.push(stats),
        }
    }

    let summary = ImportSummary {
        run_id,
        table: config.table.clone(),
        workers: workers.len(),
        files: loaded.files,
        records_read: loaded.records,
        records_written: workers.iter().map(|s| s.records_written).sum(),
        batches: workers.iter().map(|s| s.batches).sum(),
        requeued: workers.iter().map(|s| s.requeued).sum(),
        duplicates: workers.iter().map(|s| s.duplicates).sum(),
        failed_records: failures.records(),
        write_units: ctx.governor.lifetime(CapacityKind::Write),
        retries: supervisor.retries(),
        elapsed: started.elapsed(),
    };

    span.in_scope(|| {
        let accounted = summary.records_written + summary.failed_records + summary.duplicates;
        if accounted != summary.records_read {
            warn!(
                read = summary.records_read,
                accounted, "Imported record count does not match the source"
            );
        }
        if summary.failed_records > 0 {
            warn!(
                failed = summary.failed_records,
                failed_items = ?failures.path(),
                "Some records were not written"
            );
        }
        info!(
            records = summary.records_written,
            batches = summary.batches,
            requeued = summary.requeued,
            failed = summary.failed_records,
            write_units = summary.write_units,
            retries = summary.retries,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Import complete"
        )
    });
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Location;
    use crate::errors::Error;
    use crate::models::BillingMode;
    use crate::storage::S3Uri;
    use crate::testing::{MemoryObjectStore, MemoryTable};
    use serde_json::json;

    fn record(id: u32) -> Record {
        json!({"id": format!("k{:04}", id), "n": id}).as_object().cloned().unwrap()
    }

    fn table() -> Arc<MemoryTable> {
        Arc::new(MemoryTable::new("orders", KeySchema::new("id", None)))
    }

    fn context(table: Arc<MemoryTable>, queue: Arc<ImportQueue>) -> ImportContext {
        ImportContext {
            queue,
            store: table,
            governor: Arc::new(CapacityGovernor::unlimited()),
            supervisor: Supervisor::default(),
            failures: Arc::new(FailureLog::log_only()),
            key_schema: KeySchema::new("id", None),
            grace_period: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            max_item_attempts: 8,
        }
    }

    fn spawn_workers(ctx: &Arc<ImportContext>, count: usize) -> WorkerPool<ImportStats> {
        let mut pool = WorkerPool::new();
        for id in 0..count {
            pool.spawn(ImportWorker::new(id, ctx.clone()).run());
        }
        pool
    }

    #[test]
    fn test_write_units() {
        assert_eq!(write_units(&record(1)), 1.0);
        let big = json!({"id": "a", "blob": "x".repeat(2048)}).as_object().cloned().unwrap();
        assert_eq!(write_units(&big), 3.0);
    }

    #[test]
    fn test_dedupe_keeps_last_value() {
        let schema = KeySchema::new("id", None);
        let first = json!({"id": "a", "v": 1}).as_object().cloned().unwrap();
        let other = json!({"id": "b", "v": 2}).as_object().cloned().unwrap();
        let last = json!({"id": "a", "v": 3}).as_object().cloned().unwrap();

        let (unique, collapsed) = dedupe_by_key(&schema, vec![first, other.clone(), last.clone()]);
        assert_eq!(unique, vec![last, other]);
        assert_eq!(collapsed, 1);
    }

    #[test]
    fn test_dedupe_treats_equal_numbers_as_one_key() {
        let schema = KeySchema::new("id", None);
        let whole = json!({"id": 10, "v": "first"}).as_object().cloned().unwrap();
        let decimal = json!({"id": 10.0, "v": "second"}).as_object().cloned().unwrap();

        let (unique, collapsed) = dedupe_by_key(&schema, vec![whole, decimal.clone()]);
        assert_eq!(unique, vec![decimal]);
        assert_eq!(collapsed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_item_within_grace_is_consumed() {
        let table = table();
        let queue = Arc::new(ImportQueue::new(200));
        let ctx = Arc::new(context(table.clone(), queue.clone()));
        let pool = spawn_workers(&ctx, 3);

        for i in 0..100 {
            queue.push(vec![record(i)]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(table.len(), 100);

        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.push(vec![record(100)]).await.unwrap();

        let stats = pool.join().await.unwrap();
        assert_eq!(table.len(), 101);
        assert_eq!(stats.iter().map(|s| s.records_written).sum::<u64>(), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_exit_after_grace() {
        let table = table();
        let queue = Arc::new(ImportQueue::new(10));
        let ctx = Arc::new(context(table, queue.clone()));
        let started = Instant::now();

        spawn_workers(&ctx, 2).join().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(70));
        assert!(queue.push(vec![record(1)]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprocessed_items_are_retried_once() {
        let table = table();
        table.plan_unprocessed([3]);
        let queue = Arc::new(ImportQueue::new(10));
        let ctx = Arc::new(context(table.clone(), queue.clone()));

        let batch: Vec<Record> = (0..10).map(record).collect();
        queue.push(batch.clone()).await.unwrap();
        queue.close();

        let stats = spawn_workers(&ctx, 1).join().await.unwrap();
        assert_eq!(table.write_calls(), 2);
        assert_eq!(table.len(), 10);
        for r in &batch[7..] {
            assert_eq!(table.get(r).as_ref(), Some(r));
        }
        assert_eq!(stats[0].records_written, 10);
        assert_eq!(stats[0].requeued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_item_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let failed_path = dir.path().join("failed.json");
        let table = table();
        table.reject(&record(2));
        let queue = Arc::new(ImportQueue::new(10));
        let failures = Arc::new(FailureLog::open(Some(&failed_path)).await.unwrap());
        let ctx = Arc::new(ImportContext {
            failures: failures.clone(),
            max_item_attempts: 3,
            ..context(table.clone(), queue.clone())
        });

        queue.push((0..5).map(record).collect()).await.unwrap();
        queue.close();
        let stats = spawn_workers(&ctx, 2).join().await.unwrap();

        assert_eq!(table.len(), 4);
        assert_eq!(table.write_calls(), 3);
        assert_eq!(failures.records(), 1);
        assert_eq!(stats.iter().map(|s| s.failed_records).sum::<u64>(), 1);
        let written: Record = serde_json::from_str(std::fs::read_to_string(&failed_path).unwrap().trim()).unwrap();
        assert_eq!(written, record(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_budget_splits_batches() {
        let table = table();
        let queue = Arc::new(ImportQueue::new(10));
        let ctx = Arc::new(ImportContext {
            governor: Arc::new(CapacityGovernor::with_window(None, Some(10.0), Duration::from_secs(60))),
            ..context(table.clone(), queue.clone())
        });

        queue.push((0..25).map(record).collect()).await.unwrap();
        queue.close();
        let started = Instant::now();
        spawn_workers(&ctx, 1).join().await.unwrap();

        assert_eq!(table.len(), 25);
        assert_eq!(table.largest_batch(), 10);
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    fn source_store(lines: &str) -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        store.insert("in/part-1.json", lines.to_string());
        store
    }

    fn s3_config(workers: usize) -> ImportConfig {
        let location = Location::S3(S3Uri {
            bucket: "bucket".into(),
            prefix: "in/".into(),
        });
        ImportConfig::new("orders", location, workers)
    }

    #[tokio::test]
    async fn test_run_import_end_to_end() {
        let body: String = (0..60)
            .map(|i| format!("{}\n", serde_json::to_string(&record(i)).unwrap()))
            .collect();
        let table = table();

        let summary = run_import(&s3_config(3), table.clone(), Some(source_store(&body)))
            .await
            .unwrap();

        assert_eq!(table.len(), 60);
        assert_eq!(summary.records_read, 60);
        assert_eq!(summary.records_written, 60);
        assert_eq!(summary.failed_records, 0);
        assert!(table.largest_batch() <= 25);
        assert_eq!(summary.write_units, 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_source_reads_are_retried() {
        let table = table();
        let objects = source_store("{\"id\":\"a\",\"v\":1}\n");
        // One throttled list, then one throttled get
        objects.throttle_next(2);

        let summary = run_import(&s3_config(1), table.clone(), Some(objects))
            .await
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.retries, 2);
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_collapsed() {
        let body = "{\"id\":\"a\",\"v\":1}\n{\"id\":\"a\",\"v\":2}\n{\"id\":\"b\",\"v\":3}\n";
        let table = table();

        let summary = run_import(&s3_config(1), table.clone(), Some(source_store(body)))
            .await
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(summary.duplicates, 1);
        let a = table.get(&json!({"id": "a"}).as_object().cloned().unwrap()).unwrap();
        assert_eq!(a["v"], 2);
    }

    #[tokio::test]
    async fn test_malformed_source_stops_the_run() {
        let body = "{\"id\":\"a\"}\nnot json\n";
        let table = table();

        let err = run_import(&s3_config(2), table.clone(), Some(source_store(body)))
            .await
            .unwrap_err();
        match err {
            Error::MalformedSource { location, .. } => assert_eq!(location, "s3://bucket/in/part-1.json:2"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_ceiling_above_provisioned_fails() {
        let table = Arc::new(
            MemoryTable::new("orders", KeySchema::new("id", None)).with_billing(BillingMode::Provisioned {
                read_units: 5,
                write_units: 5,
            }),
        );
        let mut config = s3_config(1);
        config.write_capacity = Some(50);

        let err = run_import(&config, table.clone(), Some(source_store("{\"id\":\"a\"}\n")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "insufficient_capacity");
        assert_eq!(table.write_calls(), 0);
    }
}
