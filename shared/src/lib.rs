//! DDB Transfer Core Library
//!
//! Shared functionality for the `ddb-export` and `ddb-import` tools including:
//! - Domain models and error types
//! - The capacity governor, segment planner and import queue
//! - Export and import workers with retry supervision
//! - DynamoDB and S3 adapters

pub mod config;
pub mod dynamo;
pub mod errors;
pub mod export;
pub mod failures;
pub mod governor;
pub mod import;
pub mod logging;
pub mod models;
pub mod output;
pub mod pool;
pub mod preflight;
pub mod queue;
pub mod retry;
pub mod segment;
pub mod source;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ExportConfig, ImportConfig, Location, LogFormat};
pub use dynamo::{DynamoClient, TableStore};
pub use errors::{Error, Result};
pub use export::{open_sink, run_export, ExportSummary};
pub use governor::CapacityGovernor;
pub use import::{run_import, ImportSummary};
pub use models::*;
pub use retry::{RetryPolicy, Supervisor};
pub use segment::SegmentPlanner;
pub use storage::{ObjectStore, S3Store, S3Uri};
