//! DDB Transfer Export
//!
//! Scans a table with parallel segments and writes newline-delimited JSON
//! files to a local directory or an S3 prefix.

use std::process;
use std::sync::Arc;

use anyhow::Result;
use aws_config::{BehaviorVersion, Region};
use clap::Parser;
use ddbtransfer_core::config::DEFAULT_MAX_FILE_MB;
use ddbtransfer_core::{
    logging, open_sink, run_export, DynamoClient, ExportConfig, Location, LogFormat, ObjectStore,
    RetryPolicy, S3Store,
};
use tracing::error;

/// Export a DynamoDB table to JSON files
///
/// ```bash
/// ddb-export -r us-east-1 -t orders -p 8 -c 1000 -s 512 -d s3://backups/orders/
/// ```
#[derive(Debug, Parser)]
#[command(name = "ddb-export", about = "Exports a DynamoDB table to newline-delimited JSON files.")]
struct Opt {
    /// AWS region
    #[arg(short = 'r', long, env = "AWS_REGION")]
    region: String,

    /// Table to export
    #[arg(short = 't', long)]
    table: String,

    /// Worker count
    #[arg(short = 'p', long, default_value_t = 4)]
    processes: usize,

    /// Read capacity ceiling, in units per second
    #[arg(short = 'c', long)]
    capacity: u32,

    /// Maximum output file size in MB
    #[arg(short = 's', long = "max-file-mb", default_value_t = DEFAULT_MAX_FILE_MB)]
    max_file_mb: u64,

    /// Local directory or s3://bucket/prefix
    #[arg(short = 'd', long)]
    destination: Location,

    /// Scan segments; defaults to one per worker
    #[arg(long)]
    segments: Option<u32>,

    /// Attempts per scan page or upload before giving up
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,

    /// Log format: plain|json
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,
}

impl Opt {
    fn config(&self) -> ExportConfig {
        let mut config = ExportConfig::new(
            self.table.clone(),
            self.destination.clone(),
            self.processes,
            self.capacity,
        );
        config.segments = self.segments;
        config.max_file_mb = self.max_file_mb;
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
    let objects: Option<Arc<dyn ObjectStore>> = match &config.destination {
        Location::S3(uri) => Some(Arc::new(S3Store::from_sdk_config(&sdk_config, uri.bucket.clone()))),
        Location::Local(_) => None,
    };

    let result = async {
        let sink = open_sink(&config.destination, objects).await?;
        run_export(&config, store, sink).await
    }
    .await;

    match result {
        Ok(summary) => {
            println!("{}", summary);
            Ok(())
        }
        Err(e) => {
            error!(code = e.code(), error = %e, "Export failed");
            eprintln!("ddb-export error: {}", e);
            process::exit(e.exit_code());
        }
    }
}
