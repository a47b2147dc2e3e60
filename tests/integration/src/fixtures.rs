//! Test fixtures and utilities

use std::collections::BTreeMap;

use ddbtransfer_core::{KeySchema, Record};
use serde_json::json;
use uuid::Uuid;

/// Generate a unique table name for testing
pub fn unique_table_name() -> String {
    format!("test-table-{}", &Uuid::new_v4().to_string()[..8])
}

/// Key schema used by every fixture table
pub fn key_schema() -> KeySchema {
    KeySchema::new("pk", Some("sk".to_string()))
}

/// `count` records spread over a few hundred partition keys
pub fn records(count: u32) -> Vec<Record> {
    (0..count)
        .map(|i| {
            json!({
                "pk": format!("customer-{:03}", i % 331),
                "sk": i,
                "status": if i % 3 == 0 { "shipped" } else { "pending" },
                "lines": [{"sku": format!("sku-{}", i % 17), "qty": i % 5 + 1}],
                "notes": null,
            })
            .as_object()
            .cloned()
            .unwrap_or_default()
        })
        .collect()
}

/// Records indexed by primary key, for order-independent comparison
pub fn by_key(records: impl IntoIterator<Item = Record>) -> BTreeMap<String, Record> {
    let schema = key_schema();
    records
        .into_iter()
        .map(|record| (schema.key_of(&record), record))
        .collect()
}

/// Check if a DynamoDB endpoint is configured
pub fn endpoint_configured() -> bool {
    std::env::var(ddbtransfer_core::dynamo::ENDPOINT_ENV).is_ok()
}

/// Skip test if no DynamoDB endpoint is configured
#[macro_export]
macro_rules! skip_if_no_endpoint {
    () => {
        if !$crate::fixtures::endpoint_configured() {
            eprintln!("Skipping test: DDB_TRANSFER_ENDPOINT not set");
            return;
        }
    };
}
