//! DDB Transfer Integration Tests
//!
//! These tests run against either:
//! - In-memory table and object stores (always)
//! - DynamoDB Local (set the DDB_TRANSFER_ENDPOINT environment variable)
//!
//! Run with: cargo test --package ddbtransfer-integration-tests

pub mod client;
pub mod fixtures;

pub use client::LocalDynamo;
pub use fixtures::*;
