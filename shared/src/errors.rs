//! Error types for DDB Transfer

use thiserror::Error;

/// Result type alias using DDB Transfer Error
pub type Result<T> = std::result::Result<T, Error>;

/// How the retry supervisor treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling, timeouts, 5xx, dropped connections
    Retryable,
    /// Concurrent renewal of short-lived credentials raced and lost
    CredentialRefresh,
    /// Permission, validation, missing resources, bad input
    Fatal,
}

/// DDB Transfer error types
#[derive(Error, Debug)]
pub enum Error {
    /// Table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table exists but cannot serve a transfer yet
    #[error("Table {table} is {status}, it must be ACTIVE")]
    TableNotActive { table: String, status: String },

    /// Provisioned capacity below the requested ceiling
    #[error("Table {table} has {provisioned} provisioned units, below the requested {requested}")]
    InsufficientCapacity {
        table: String,
        provisioned: i64,
        requested: u32,
    },

    /// Caller is not allowed to perform the operation
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Invalid configuration or malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// A source line that cannot be imported
    #[error("Malformed source {location}: {reason}")]
    MalformedSource { location: String, reason: String },

    /// Service asked us to slow down
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Timeout, connection failure, or 5xx
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Temporary credentials expired or were being renewed
    #[error("Credential refresh failed: {0}")]
    CredentialRefresh(String),

    /// Non-retryable DynamoDB error
    #[error("Database error: {0}")]
    Database(String),

    /// Non-retryable object store error
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// DynamoDB serialization error
    #[error("DynamoDB serialization error: {0}")]
    DynamoSerialization(String),

    /// A single operation ran out of attempts
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::TableNotFound(_) => "table_not_found",
            Error::TableNotActive { .. } => "table_not_active",
            Error::InsufficientCapacity { .. } => "insufficient_capacity",
            Error::AccessDenied(_) => "access_denied",
            Error::Validation(_) => "validation_error",
            Error::MalformedSource { .. } => "malformed_source",
            Error::Throttled(_) => "throttled",
            Error::Transient(_) => "transient",
            Error::CredentialRefresh(_) => "credential_refresh",
            Error::Database(_) => "database_error",
            Error::ObjectStore(_) => "object_store_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::DynamoSerialization(_) => "serialization_error",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Returns how the supervisor should treat this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Throttled(_) | Error::Transient(_) => ErrorClass::Retryable,
            Error::CredentialRefresh(_) => ErrorClass::CredentialRefresh,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }

    /// Returns the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) | Error::MalformedSource { .. } => 2,
            Error::TableNotFound(_)
            | Error::TableNotActive { .. }
            | Error::InsufficientCapacity { .. }
            | Error::AccessDenied(_) => 3,
            Error::RetriesExhausted { .. } => 4,
            _ => 1,
        }
    }
}
