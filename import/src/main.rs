//! DDB Transfer Import
//!
//! Loads newline-delimited JSON files from a local path or an S3 prefix and
//! batch-writes them into a table.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aws_config::{BehaviorVersion, Region};
use clap::Parser;
use ddbtransfer_core::config::DEFAULT_MAX_ITEM_ATTEMPTS;
use ddbtransfer_core::{
    logging, run_import, DynamoClient, ImportConfig, Location, LogFormat, ObjectStore, RetryPolicy,
    S3Store,
};
use tracing::error;

/// Import JSON files into a DynamoDB table
///
/// ```bash
/// ddb-import -r us-east-1 -t orders -s ./exports -p 8 -c 500
/// ```
#[derive(Debug, Parser)]
#[command(name = "ddb-import", about = "Imports newline-delimited JSON files into a DynamoDB table.")]
struct Opt {
    /// AWS region
    #[arg(short = 'r', long, env = "AWS_REGION")]
    region: String,

    /// Table to import into
    #[arg(short = 't', long)]
    table: String,

    /// File, directory, or s3://bucket/prefix
    #[arg(short = 's', long)]
    source: Location,

    /// Worker count
    #[arg(short = 'p', long, default_value_t = 4)]
    processes: usize,

    /// Write capacity ceiling, in units per second; unlimited when omitted
    #[arg(short = 'c', long)]
    capacity: Option<u32>,

    /// Append permanently failed records to this file
    #[arg(long)]
    failed_items: Option<PathBuf>,

    /// Seconds an idle worker keeps polling before it exits
    #[arg(long, default_value_t = 60)]
    grace_period_secs: u64,

    /// Write attempts per batch before its records are reported as failed
    #[arg(long, default_value_t = DEFAULT_MAX_ITEM_ATTEMPTS)]
    max_item_attempts: u32,

    /// Attempts per single request before giving up
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,

    /// Log format: plain|json
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

impl Opt {
    fn config(&self) -> ImportConfig {
        let mut config = ImportConfig::new(self.table.clone(), self.source.clone(), self.processes);
        config.write_capacity = self.capacity;
        config.failed_items = self.failed_items.clone();
        config.grace_period = Duration::from_secs(self.grace_period_secs);
        config.max_item_attempts = self.max_item_attempts;
        config.retry = RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        };
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    logging::init(opt.log_format);

    let config = opt.config();
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(opt.region.clone()))
        .load()
        .await;

    let store = Arc::new(DynamoClient::from_sdk_config(&sdk_config, config.table.clone()));
    let objects: Option<Arc<dyn ObjectStore>> = match &config.source {
        Location::S3(uri) => Some(Arc::new(S3Store::from_sdk_config(&sdk_config, uri.bucket.clone()))),
        Location::Local(_) => None,
    };

    match run_import(&config, store, objects).await {
        Ok(summary) => {
            println!("{}", summary);
            if summary.failed_records > 0 {
                process::exit(5);
            }
            Ok(())
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "Import failed");
            eprintln!("ddb-import error: {}", e);
            process::exit(e.exit_code());
        }
    }
}
