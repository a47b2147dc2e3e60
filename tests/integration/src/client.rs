//! DynamoDB Local helper for testing

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use ddbtransfer_core::dynamo::ENDPOINT_ENV;
use ddbtransfer_core::DynamoClient;

/// Creates and drops throwaway tables on DynamoDB Local
pub struct LocalDynamo {
    sdk_config: SdkConfig,
    client: Client,
}

impl LocalDynamo {
    /// Connect to the endpoint in DDB_TRANSFER_ENDPOINT, None when unset
    pub async fn connect() -> Option<Self> {
        let endpoint = std::env::var(ENDPOINT_ENV).ok()?;
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("local", "local", None, None, "static"))
            .load()
            .await;
        let client = Client::from_conf(
            aws_sdk_dynamodb::config::Builder::from(&sdk_config)
                .endpoint_url(endpoint)
                .build(),
        );
        Some(Self { sdk_config, client })
    }

    /// Store bound to `table`, going through the same endpoint override as the tools
    pub fn store(&self, table: &str) -> DynamoClient {
        DynamoClient::from_sdk_config(&self.sdk_config, table)
    }

    /// Create an on-demand table keyed by `pk` (string) and `sk` (number)
    pub async fn create_table(&self, table: &str) -> Result<()> {
        self.client
            .create_table()
            .table_name(table)
            .billing_mode(BillingMode::PayPerRequest)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("pk")
                    .attribute_type(ScalarAttributeType::S)
                    .build()?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("sk")
                    .attribute_type(ScalarAttributeType::N)
                    .build()?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("pk")
                    .key_type(KeyType::Hash)
                    .build()?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("sk")
                    .key_type(KeyType::Range)
                    .build()?,
            )
            .send()
            .await
            .with_context(|| format!("Failed to create table {}", table))?;
        Ok(())
    }

    pub async fn delete_table(&self, table: &str) -> Result<()> {
        self.client
            .delete_table()
            .table_name(table)
            .send()
            .await
            .with_context(|| format!("Failed to delete table {}", table))?;
        Ok(())
    }
}
