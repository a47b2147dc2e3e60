//! Object storage for export destinations and import sources

use std::pin::Pin;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncBufRead;

use crate::errors::{Error, Result};
use crate::retry::classify_sdk_error;

/// Streamed object body, read line by line by the import loader
pub type LineReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// The object-store collaborator
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a whole object in a single put
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Open an object for streaming reads
    async fn get(&self, key: &str) -> Result<LineReader>;

    /// Every key under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Full URI of a key, for logs
    fn uri(&self, key: &str) -> String;
}

/// A parsed `s3://bucket/prefix` location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Uri {
    pub bucket: String,
    /// Key prefix without a leading slash; may be empty
    pub prefix: String,
}

impl S3Uri {
    pub const SCHEME: &'static str = "s3://";

    /// Parse an `s3://` URI, None when the scheme does not match
    pub fn parse(uri: &str) -> Option<Result<Self>> {
        let rest = uri.strip_prefix(Self::SCHEME)?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Some(Err(Error::Validation(format!("missing bucket in {}", uri))));
        }
        Some(Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        }))
    }
}

/// S3-backed object store for one bucket
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store").field("bucket", &self.bucket).finish()
    }
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig, bucket: impl Into<String>) -> Self {
        Self::new(Client::new(sdk_config), bucket)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/x-ndjson")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&self.uri(key), e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<LineReader> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&self.uri(key), e))?;
        Ok(Box::pin(result.body.into_async_read()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let result = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| classify_sdk_error(&self.uri(prefix), e))?;

            keys.extend(
                result
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match result.next_continuation_token() {
                Some(token) if result.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    fn uri(&self, key: &str) -> String {
        format!("{}{}/{}", S3Uri::SCHEME, self.bucket, key)
    }
}
