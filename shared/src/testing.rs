//! In-memory table and object stores
//!
//! Deterministic stand-ins for DynamoDB and S3 used by unit and integration
//! tests. The table hashes primary keys into scan segments, pages results,
//! reports consumed capacity, and can be told to throttle or to leave items
//! unprocessed.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::dynamo::TableStore;
use crate::errors::{Error, Result};
use crate::models::*;
use crate::storage::{LineReader, ObjectStore};

/// In-memory table store
pub struct MemoryTable {
    name: String,
    key_schema: KeySchema,
    status: String,
    billing: BillingMode,
    page_size: usize,
    /// Report consumed capacity on scans and writes
    report_consumed: bool,
    items: Mutex<BTreeMap<String, Record>>,
    /// Fail this many upcoming calls with a throttling error
    throttle_next: AtomicU32,
    /// Leave this many trailing items unprocessed on upcoming writes
    unprocessed_plan: Mutex<VecDeque<usize>>,
    /// Keys that are never written
    rejected_keys: Mutex<HashSet<String>>,
    scan_calls: AtomicU64,
    write_calls: AtomicU64,
    /// Largest batch size seen
    largest_batch: AtomicU64,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>, key_schema: KeySchema) -> Self {
        Self {
            name: name.into(),
            key_schema,
            status: "ACTIVE".to_string(),
            billing: BillingMode::OnDemand,
            page_size: 100,
            report_consumed: true,
            items: Mutex::new(BTreeMap::new()),
            throttle_next: AtomicU32::new(0),
            unprocessed_plan: Mutex::new(VecDeque::new()),
            rejected_keys: Mutex::new(HashSet::new()),
            scan_calls: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
            largest_batch: AtomicU64::new(0),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_billing(mut self, billing: BillingMode) -> Self {
        self.billing = billing;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Leave consumed capacity out of responses, like some local endpoints
    pub fn without_consumed_capacity(mut self) -> Self {
        self.report_consumed = false;
        self
    }

    /// Seed the table directly
    pub fn insert(&self, record: Record) {
        let key = self.key_schema.key_of(&record);
        self.lock_items().insert(key, record);
    }

    pub fn throttle_next(&self, calls: u32) {
        self.throttle_next.store(calls, Ordering::SeqCst);
    }

    /// Queue up partial failures: the n-th upcoming write leaves `plan[n]` items unprocessed
    pub fn plan_unprocessed(&self, plan: impl IntoIterator<Item = usize>) {
        self.unprocessed_plan
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(plan);
    }

    /// Never write the record with this primary key
    pub fn reject(&self, record: &Record) {
        let key = self.key_schema.key_of(record);
        self.rejected_keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key);
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &Record) -> Option<Record> {
        self.lock_items().get(&self.key_schema.key_of(key)).cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        self.lock_items().values().cloned().collect()
    }

    pub fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn largest_batch(&self) -> u64 {
        self.largest_batch.load(Ordering::SeqCst)
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Record>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_throttle(&self) -> bool {
        self.throttle_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn segment_of(key: &str, total: u32) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(total)) as u32
    }

    fn read_units(record: &Record) -> f64 {
        let size = serde_json::to_vec(record).map(|v| v.len()).unwrap_or(0);
        // Eventually consistent: half a unit per 4 KB
        (size.max(1) as f64 / 4096.0).ceil() * 0.5
    }

    fn write_units(record: &Record) -> f64 {
        let size = serde_json::to_vec(record).map(|v| v.len()).unwrap_or(0);
        (size.max(1) as f64 / 1024.0).ceil()
    }
}

#[async_trait]
impl TableStore for MemoryTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn describe_table(&self) -> Result<TableDescription> {
        Ok(TableDescription {
            table_name: self.name.clone(),
            status: self.status.clone(),
            key_schema: self.key_schema.clone(),
            billing: self.billing.clone(),
            item_count: Some(self.len() as i64),
        })
    }

    async fn scan_segment(
        &self,
        segment: Segment,
        start_key: Option<&Record>,
        limit: Option<i32>,
    ) -> Result<ScanPage> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_throttle() {
            return Err(Error::Throttled("ProvisionedThroughputExceededException".into()));
        }
        if segment.index >= segment.total {
            return Err(Error::Validation(format!("bad segment {}", segment)));
        }

        let page_size = limit
            .map(|l| (l.max(1) as usize).min(self.page_size))
            .unwrap_or(self.page_size);
        let after = start_key.map(|k| self.key_schema.key_of(k));

        let items = self.lock_items();
        let mut matching = items
            .iter()
            .filter(|(key, _)| Self::segment_of(key, segment.total) == segment.index)
            .filter(|(key, _)| after.as_ref().map_or(true, |a| key.as_str() > a.as_str()));

        let records: Vec<Record> = matching.by_ref().take(page_size).map(|(_, r)| r.clone()).collect();
        let more = matching.next().is_some();

        let consumed_units = if self.report_consumed {
            records.iter().map(Self::read_units).sum()
        } else {
            0.0
        };
        let last_evaluated_key = match records.last() {
            Some(last) if more => Some(self.key_schema.project(last)),
            _ => None,
        };

        Ok(ScanPage {
            records,
            last_evaluated_key,
            consumed_units,
        })
    }

    async fn batch_write(&self, records: &[Record]) -> Result<BatchWriteOutcome> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_throttle() {
            return Err(Error::Throttled("ProvisionedThroughputExceededException".into()));
        }
        if records.len() > BATCH_WRITE_MAX_ITEMS {
            return Err(Error::Validation(format!("batch of {} is too large", records.len())));
        }
        let mut keys = HashSet::new();
        for record in records {
            self.key_schema.check(record)?;
            if !keys.insert(self.key_schema.key_of(record)) {
                return Err(Error::Validation("Provided list of item keys contains duplicates".into()));
            }
        }
        self.largest_batch.fetch_max(records.len() as u64, Ordering::SeqCst);

        let planned = self
            .unprocessed_plan
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(0)
            .min(records.len());
        let rejected = self.rejected_keys.lock().unwrap_or_else(|p| p.into_inner()).clone();

        let mut unprocessed = Vec::new();
        let mut consumed_units = 0.0;
        let mut items = self.lock_items();
        for (i, record) in records.iter().enumerate() {
            let key = self.key_schema.key_of(record);
            if i >= records.len() - planned || rejected.contains(&key) {
                unprocessed.push(record.clone());
                continue;
            }
            consumed_units += Self::write_units(record);
            items.insert(key, record.clone());
        }

        Ok(BatchWriteOutcome {
            unprocessed,
            consumed_units: if self.report_consumed { consumed_units } else { 0.0 },
        })
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Fail this many upcoming get/list calls with a throttling error
    throttle_next: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            throttle_next: AtomicU32::new(0),
        }
    }

    pub fn throttle_next(&self, calls: u32) {
        self.throttle_next.store(calls, Ordering::SeqCst);
    }

    fn check_throttle(&self) -> Result<()> {
        let throttled = self
            .throttle_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(Error::Throttled(format!("SlowDown: {}", self.bucket)));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.lock().insert(key.into(), body.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.lock().insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<LineReader> {
        self.check_throttle()?;
        let body = self
            .object(key)
            .ok_or_else(|| Error::ObjectStore(format!("{} not found", self.uri(key))))?;
        Ok(Box::pin(std::io::Cursor::new(body)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_throttle()?;
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
