//! DynamoDB operations for DDB Transfer
//!
//! The engine only needs three calls from the table store:
//!
//! | Operation        | DynamoDB API     | Used by        |
//! |------------------|------------------|----------------|
//! | `describe_table` | DescribeTable    | pre-flight     |
//! | `scan_segment`   | Scan (parallel)  | export workers |
//! | `batch_write`    | BatchWriteItem   | import workers |
//!
//! Items cross this boundary as plain JSON records, converted with
//! `serde_dynamo`, so the rest of the crate never handles SDK types.

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeValue, BillingMode as DynamoBillingMode, KeyType, PutRequest,
    ReturnConsumedCapacity, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use serde_dynamo::{from_item, to_item};
use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::models::*;
use crate::retry::classify_sdk_error;

/// Endpoint override, e.g. DynamoDB Local (from environment)
pub const ENDPOINT_ENV: &str = "DDB_TRANSFER_ENDPOINT";

/// The table-store collaborator
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Name of the table this store reads and writes
    fn table_name(&self) -> &str;

    /// Status, key schema and billing mode
    async fn describe_table(&self) -> Result<TableDescription>;

    /// Scan one page of a segment, resuming after `start_key`
    async fn scan_segment(
        &self,
        segment: Segment,
        start_key: Option<&Record>,
        limit: Option<i32>,
    ) -> Result<ScanPage>;

    /// Put up to [`BATCH_WRITE_MAX_ITEMS`] records
    async fn batch_write(&self, records: &[Record]) -> Result<BatchWriteOutcome>;
}

/// DynamoDB client bound to one table
#[derive(Clone)]
pub struct DynamoClient {
    client: Client,
    table_name: String,
}

impl std::fmt::Debug for DynamoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoClient")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoClient {
    /// Create a new DynamoDB client for a table
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Build from shared SDK config, honoring the endpoint override
    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig, table_name: impl Into<String>) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            builder = builder.endpoint_url(endpoint);
        }
        Self::new(Client::from_conf(builder.build()), table_name)
    }

    fn to_dynamo_item(record: &Record) -> Result<HashMap<String, AttributeValue>> {
        to_item(record).map_err(|e| Error::DynamoSerialization(e.to_string()))
    }

    fn from_dynamo_item(item: HashMap<String, AttributeValue>) -> Result<Record> {
        from_item(item).map_err(|e| Error::DynamoSerialization(e.to_string()))
    }
}

#[async_trait]
impl TableStore for DynamoClient {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn describe_table(&self) -> Result<TableDescription> {
        let result = self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&self.table_name, e))?;

        let table = result
            .table
            .ok_or_else(|| Error::TableNotFound(self.table_name.clone()))?;

        let mut partition_key = None;
        let mut sort_key = None;
        for element in table.key_schema() {
            match element.key_type() {
                KeyType::Hash => partition_key = Some(element.attribute_name().to_string()),
                KeyType::Range => sort_key = Some(element.attribute_name().to_string()),
                _ => {}
            }
        }
        let partition_key = partition_key
            .ok_or_else(|| Error::Internal(format!("{} has no partition key", self.table_name)))?;

        let on_demand = table
            .billing_mode_summary()
            .and_then(|summary| summary.billing_mode())
            .is_some_and(|mode| *mode == DynamoBillingMode::PayPerRequest);
        let billing = if on_demand {
            BillingMode::OnDemand
        } else {
            let throughput = table.provisioned_throughput();
            BillingMode::Provisioned {
                read_units: throughput.and_then(|t| t.read_capacity_units()).unwrap_or(0),
                write_units: throughput.and_then(|t| t.write_capacity_units()).unwrap_or(0),
            }
        };

        Ok(TableDescription {
            table_name: self.table_name.clone(),
            status: table
                .table_status()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            key_schema: KeySchema::new(partition_key, sort_key),
            billing,
            item_count: table.item_count(),
        })
    }

    async fn scan_segment(
        &self,
        segment: Segment,
        start_key: Option<&Record>,
        limit: Option<i32>,
    ) -> Result<ScanPage> {
        let exclusive_start_key = start_key.map(Self::to_dynamo_item).transpose()?;

        let result = self
            .client
            .scan()
            .table_name(&self.table_name)
            .segment(segment.index as i32)
            .total_segments(segment.total as i32)
            .set_exclusive_start_key(exclusive_start_key)
            .set_limit(limit)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&self.table_name, e))?;

        let consumed_units = result
            .consumed_capacity
            .as_ref()
            .and_then(|c| c.capacity_units)
            .unwrap_or(0.0);

        let records = result
            .items
            .unwrap_or_default()
            .into_iter()
            .map(Self::from_dynamo_item)
            .collect::<Result<Vec<_>>>()?;

        let last_evaluated_key = match result.last_evaluated_key {
            Some(key) if !key.is_empty() => Some(Self::from_dynamo_item(key)?),
            _ => None,
        };

        Ok(ScanPage {
            records,
            last_evaluated_key,
            consumed_units,
        })
    }

    async fn batch_write(&self, records: &[Record]) -> Result<BatchWriteOutcome> {
        if records.is_empty() {
            return Ok(BatchWriteOutcome::default());
        }
        if records.len() > BATCH_WRITE_MAX_ITEMS {
            return Err(Error::Validation(format!(
                "batch of {} exceeds the {} item limit",
                records.len(),
                BATCH_WRITE_MAX_ITEMS
            )));
        }

        let requests = records
            .iter()
            .map(|record| {
                let put = PutRequest::builder()
                    .set_item(Some(Self::to_dynamo_item(record)?))
                    .build()
                    .map_err(|e| Error::Internal(e.to_string()))?;
                Ok(WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .batch_write_item()
            .request_items(&self.table_name, requests)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&self.table_name, e))?;

        let consumed_units = result
            .consumed_capacity
            .unwrap_or_default()
            .iter()
            .filter_map(|c| c.capacity_units)
            .sum();

        let unprocessed = result
            .unprocessed_items
            .unwrap_or_default()
            .remove(&self.table_name)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|request| request.put_request)
            .map(|put| Self::from_dynamo_item(put.item))
            .collect::<Result<Vec<_>>>()?;

        Ok(BatchWriteOutcome {
            unprocessed,
            consumed_units,
        })
    }
}
