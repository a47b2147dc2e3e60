//! End-to-end export and import runs
//!
//! The in-memory tests always run. The DynamoDB Local tests need
//! DDB_TRANSFER_ENDPOINT=http://localhost:8000.

use std::sync::Arc;

use ddbtransfer_core::testing::{MemoryObjectStore, MemoryTable};
use ddbtransfer_core::{
    open_sink, run_export, run_import, ExportConfig, ImportConfig, Location, ObjectStore, S3Uri,
};
use ddbtransfer_integration_tests::{
    by_key, key_schema, records, skip_if_no_endpoint, unique_table_name, LocalDynamo,
};
use pretty_assertions::assert_eq;

fn seeded_table(name: &str, count: u32) -> Arc<MemoryTable> {
    let table = MemoryTable::new(name, key_schema()).with_page_size(200);
    for record in records(count) {
        table.insert(record);
    }
    Arc::new(table)
}

fn empty_table(name: &str) -> Arc<MemoryTable> {
    Arc::new(MemoryTable::new(name, key_schema()))
}

fn bucket_location(prefix: &str) -> Location {
    Location::S3(S3Uri {
        bucket: "transfer-bucket".to_string(),
        prefix: prefix.to_string(),
    })
}

// ============================================================================
// In-memory round trips
// ============================================================================

/// Scaled-down round trip; the full-size run is `test_round_trip_one_million_records`
#[tokio::test]
async fn test_round_trip_through_object_store() {
    let source = seeded_table("orders", 20_000);
    let target = empty_table("orders-copy");
    let bucket = Arc::new(MemoryObjectStore::new("transfer-bucket"));
    let objects: Arc<dyn ObjectStore> = bucket.clone();

    let destination = bucket_location("exports/orders/");
    let mut export = ExportConfig::new("orders", destination.clone(), 6, 5_000);
    export.max_file_mb = 1;
    let sink = open_sink(&destination, Some(objects.clone())).await.unwrap();
    let exported = run_export(&export, source.clone(), sink).await.unwrap();

    assert_eq!(exported.records, 20_000);
    assert_eq!(exported.files, 6);
    assert!(bucket.keys().iter().all(|k| k.starts_with("exports/orders/orders-")));

    let import = ImportConfig::new("orders-copy", destination, 4);
    let imported = run_import(&import, target.clone(), Some(objects)).await.unwrap();

    assert_eq!(imported.records_read, 20_000);
    assert_eq!(imported.records_written, 20_000);
    assert_eq!(imported.failed_records, 0);
    assert_eq!(by_key(target.records()), by_key(source.records()));
}

#[tokio::test]
async fn test_round_trip_through_local_directory() {
    let dir = tempfile::tempdir().unwrap();
    let destination = Location::Local(dir.path().join("export"));
    let source = seeded_table("orders", 3_000);
    let target = empty_table("orders-copy");

    let mut export = ExportConfig::new("orders", destination.clone(), 3, 1_000);
    export.segments = Some(7);
    let sink = open_sink(&destination, None).await.unwrap();
    let exported = run_export(&export, source.clone(), sink).await.unwrap();
    assert_eq!(exported.segments, 7);

    let mut import = ImportConfig::new("orders-copy", destination, 5);
    import.write_capacity = Some(1_000);
    let imported = run_import(&import, target.clone(), None).await.unwrap();

    assert_eq!(imported.files, 3);
    assert_eq!(by_key(target.records()), by_key(source.records()));
}

/// Run with `cargo test -- --ignored`
#[tokio::test(flavor = "multi_thread")]
#[ignore = "holds a million records in memory three times over"]
async fn test_round_trip_one_million_records() {
    let dir = tempfile::tempdir().unwrap();
    let destination = Location::Local(dir.path().join("export"));
    let source = seeded_table("orders", 1_000_000);
    let target = empty_table("orders-copy");

    let export = ExportConfig::new("orders", destination.clone(), 8, 40_000);
    let sink = open_sink(&destination, None).await.unwrap();
    let exported = run_export(&export, source.clone(), sink).await.unwrap();
    assert_eq!(exported.records, 1_000_000);

    let import = ImportConfig::new("orders-copy", destination, 8);
    let imported = run_import(&import, target.clone(), None).await.unwrap();

    assert_eq!(imported.records_read, 1_000_000);
    assert_eq!(imported.records_written, 1_000_000);
    assert_eq!(imported.failed_records, 0);
    assert_eq!(by_key(target.records()), by_key(source.records()));
}

#[tokio::test]
async fn test_import_survives_throttling_and_partial_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.json");
    let body: String = records(500)
        .iter()
        .map(|r| format!("{}\n", serde_json::to_string(r).unwrap()))
        .collect();
    std::fs::write(&path, body).unwrap();

    let target = empty_table("orders");
    target.throttle_next(3);
    target.plan_unprocessed([5, 25, 0, 1, 12]);

    let import = ImportConfig::new("orders", Location::Local(path), 4);
    let summary = run_import(&import, target.clone(), None).await.unwrap();

    assert_eq!(target.len(), 500);
    assert_eq!(summary.records_written, 500);
    assert_eq!(summary.requeued, 4);
    assert_eq!(summary.retries, 3);
    assert!(target.largest_batch() <= 25);
}

#[tokio::test]
async fn test_failed_items_can_be_reimported() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("orders.json");
    let failed_path = dir.path().join("failed.json");
    let input = records(100);
    let body: String = input
        .iter()
        .map(|r| format!("{}\n", serde_json::to_string(r).unwrap()))
        .collect();
    std::fs::write(&source_path, body).unwrap();

    let target = empty_table("orders");
    for record in &input[40..43] {
        target.reject(record);
    }

    let mut import = ImportConfig::new("orders", Location::Local(source_path), 2);
    import.max_item_attempts = 2;
    import.failed_items = Some(failed_path.clone());
    let summary = run_import(&import, target.clone(), None).await.unwrap();

    assert_eq!(summary.failed_records, 3);
    assert_eq!(target.len(), 97);

    // The failure file is a valid import source on its own
    let retry_target = empty_table("orders");
    let retry = ImportConfig::new("orders", Location::Local(failed_path), 1);
    let resubmitted = run_import(&retry, retry_target.clone(), None).await.unwrap();

    assert_eq!(resubmitted.records_written, 3);
    assert_eq!(by_key(retry_target.records()), by_key(input[40..43].to_vec()));
}

#[tokio::test]
async fn test_missing_source_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let target = empty_table("orders");

    let import = ImportConfig::new("orders", Location::Local(dir.path().to_path_buf()), 2);
    let err = run_import(&import, target.clone(), None).await.unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(target.write_calls(), 0);
}

// ============================================================================
// DynamoDB Local
// ============================================================================

#[tokio::test]
async fn test_dynamodb_local_round_trip() {
    skip_if_no_endpoint!();
    let Some(local) = LocalDynamo::connect().await else { return };

    let source_table = unique_table_name();
    let target_table = unique_table_name();
    local.create_table(&source_table).await.expect("Failed to create source table");
    local.create_table(&target_table).await.expect("Failed to create target table");

    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seed.json");
    let input = records(1_200);
    let body: String = input
        .iter()
        .map(|r| format!("{}\n", serde_json::to_string(r).unwrap()))
        .collect();
    std::fs::write(&seed_path, body).unwrap();

    // Seed through the import path
    let seed = ImportConfig::new(source_table.clone(), Location::Local(seed_path), 4);
    let seeded = run_import(&seed, Arc::new(local.store(&source_table)), None)
        .await
        .expect("Failed to seed table");
    assert_eq!(seeded.records_written, 1_200);

    let export_dir = Location::Local(dir.path().join("export"));
    let export = ExportConfig::new(source_table.clone(), export_dir.clone(), 4, 1_000);
    let sink = open_sink(&export_dir, None).await.unwrap();
    let exported = run_export(&export, Arc::new(local.store(&source_table)), sink)
        .await
        .expect("Failed to export");
    assert_eq!(exported.records, 1_200);

    let import = ImportConfig::new(target_table.clone(), export_dir, 4);
    let imported = run_import(&import, Arc::new(local.store(&target_table)), None)
        .await
        .expect("Failed to import");
    assert_eq!(imported.records_written, 1_200);

    // Cleanup
    let _ = local.delete_table(&source_table).await;
    let _ = local.delete_table(&target_table).await;
}

#[tokio::test]
async fn test_dynamodb_local_missing_table() {
    skip_if_no_endpoint!();
    let Some(local) = LocalDynamo::connect().await else { return };

    let dir = tempfile::tempdir().unwrap();
    let destination = Location::Local(dir.path().to_path_buf());
    let export = ExportConfig::new(unique_table_name(), destination.clone(), 1, 10);
    let sink = open_sink(&destination, None).await.unwrap();

    let err = run_export(&export, Arc::new(local.store(&export.table)), sink)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "table_not_found");
}
