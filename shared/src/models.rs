//! Domain models for DDB Transfer
//!
//! These types represent the core entities moved by the engine:
//! - Records: pass-through JSON objects, one per table item
//! - Segments: disjoint slices of a parallel scan
//! - Work items: import batches claimed by exactly one worker at a time
//! - Table descriptions: what pre-flight checks need to know

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Error, Result};

/// One table item. Never mutated by the engine.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Maximum items per batch-write call
pub const BATCH_WRITE_MAX_ITEMS: usize = 25;

/// Which side of the capacity budget an operation draws on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityKind {
    Read,
    Write,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityKind::Read => write!(f, "read"),
            CapacityKind::Write => write!(f, "write"),
        }
    }
}

/// Primary key attributes of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    pub partition_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
}

impl KeySchema {
    pub fn new(partition_key: impl Into<String>, sort_key: Option<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key,
        }
    }

    /// Names of the key attributes, partition key first
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.partition_key.as_str()).chain(self.sort_key.as_deref())
    }

    /// Fails when a key attribute is absent or null
    pub fn check(&self, record: &Record) -> Result<()> {
        for name in self.attributes() {
            match record.get(name) {
                None | Some(serde_json::Value::Null) => {
                    return Err(Error::Validation(format!("missing key attribute {}", name)));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Stable string form of a record's primary key
    ///
    /// Numbers compare by value, so `1` and `1.0` name the same item.
    pub fn key_of(&self, record: &Record) -> String {
        self.attributes()
            .map(|name| record.get(name).map(key_text).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Projects just the key attributes of a record
    pub fn project(&self, record: &Record) -> Record {
        self.attributes()
            .filter_map(|name| record.get(name).map(|v| (name.to_string(), v.clone())))
            .collect()
    }
}

fn key_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER => format!("{}", f as i64),
            Some(f) => format!("{}", f),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Largest magnitude below which every integral f64 is exact
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// How a table is billed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    Provisioned { read_units: i64, write_units: i64 },
    OnDemand,
}

/// What the pre-flight checks learn from the table store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescription {
    pub table_name: String,
    /// e.g. ACTIVE, CREATING, UPDATING
    pub status: String,
    pub key_schema: KeySchema,
    pub billing: BillingMode,
    /// Approximate, refreshed by the service every few hours
    pub item_count: Option<i64>,
}

impl TableDescription {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }

    /// Provisioned units for a capacity kind, None when on-demand
    pub fn provisioned(&self, kind: CapacityKind) -> Option<i64> {
        match self.billing {
            BillingMode::Provisioned {
                read_units,
                write_units,
            } => Some(match kind {
                CapacityKind::Read => read_units,
                CapacityKind::Write => write_units,
            }),
            BillingMode::OnDemand => None,
        }
    }
}

/// A disjoint slice of a parallel scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub total: u32,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// One page of a segment scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub records: Vec<Record>,
    /// Key of the last evaluated item; None when the segment is exhausted
    pub last_evaluated_key: Option<Record>,
    /// Actual units reported by the service
    pub consumed_units: f64,
}

/// Result of one batch-write call
#[derive(Debug, Clone, Default)]
pub struct BatchWriteOutcome {
    /// Records the service did not write; partial failure is normal
    pub unprocessed: Vec<Record>,
    pub consumed_units: f64,
}

/// An import batch
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Assigned by the queue when the batch is first enqueued
    pub sequence: u64,
    /// How many write attempts have already been made for these records
    pub attempts: u32,
    pub records: Vec<Record>,
}

impl WorkItem {
    pub fn new(sequence: u64, records: Vec<Record>) -> Self {
        Self {
            sequence,
            attempts: 0,
            records,
        }
    }

    /// Wraps unprocessed records for another attempt, keeping the sequence number
    pub fn retry_with(&self, unprocessed: Vec<Record>) -> Self {
        Self {
            sequence: self.sequence,
            attempts: self.attempts + 1,
            records: unprocessed,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// An import batch given up on, kept for manual resubmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub sequence: u64,
    pub attempts: u32,
    pub worker: usize,
    pub reason: String,
    pub records: Vec<Record>,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_schema_check() {
        let schema = KeySchema::new("hash", Some("range".into()));
        assert!(schema.check(&record(json!({"hash": "a", "range": "b", "v": 1}))).is_ok());

        let err = schema.check(&record(json!({"hash": "a"}))).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: missing key attribute range");

        assert!(schema.check(&record(json!({"hash": null, "range": "b"}))).is_err());
    }

    #[test]
    fn test_key_of_and_project() {
        let schema = KeySchema::new("hash", Some("range".into()));
        let item = record(json!({"hash": "a", "range": 7, "val": "x"}));
        assert_eq!(schema.key_of(&item), r#""a"|7"#);
        assert_eq!(schema.project(&item), record(json!({"hash": "a", "range": 7})));
    }

    #[test]
    fn test_numeric_keys_compare_by_value() {
        let schema = KeySchema::new("hash", Some("range".into()));
        let whole = record(json!({"hash": "a", "range": 1}));
        let decimal = record(json!({"hash": "a", "range": 1.0}));
        let fraction = record(json!({"hash": "a", "range": 1.5}));
        assert_eq!(schema.key_of(&whole), schema.key_of(&decimal));
        assert_eq!(schema.key_of(&fraction), r#""a"|1.5"#);
        assert_ne!(schema.key_of(&whole), schema.key_of(&record(json!({"hash": "a", "range": "1"}))));
    }

    #[test]
    fn test_partition_key_only() {
        let schema = KeySchema::new("id", None);
        assert_eq!(schema.attributes().collect::<Vec<_>>(), vec!["id"]);
        assert!(schema.check(&record(json!({"id": 1}))).is_ok());
    }

    #[test]
    fn test_provisioned_units() {
        let table = TableDescription {
            table_name: "orders".into(),
            status: "ACTIVE".into(),
            key_schema: KeySchema::new("id", None),
            billing: BillingMode::Provisioned {
                read_units: 100,
                write_units: 50,
            },
            item_count: None,
        };
        assert!(table.is_active());
        assert_eq!(table.provisioned(CapacityKind::Read), Some(100));
        assert_eq!(table.provisioned(CapacityKind::Write), Some(50));
    }

    #[test]
    fn test_work_item_retry_keeps_sequence() {
        let item = WorkItem::new(42, vec![record(json!({"id": 1})), record(json!({"id": 2}))]);
        let retry = item.retry_with(vec![record(json!({"id": 2}))]);
        assert_eq!(retry.sequence, 42);
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.len(), 1);
    }

    #[test]
    fn test_capacity_kind_serialization() {
        assert_eq!(serde_json::to_string(&CapacityKind::Read).unwrap(), r#""read""#);
        assert_eq!(CapacityKind::Write.to_string(), "write");
    }
}
