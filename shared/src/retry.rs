//! Retry and backoff supervision
//!
//! Every network call goes through [`Supervisor::run`], which classifies
//! failures (see [`Error::class`]) and re-attempts the retryable ones on a
//! `tokio_retry` exponential backoff up to a per-operation cap. Credential-refresh races
//! get their own short backoff curve since they heal on the next attempt.
//!
//! SDK errors are mapped into [`Error`] by [`classify_sdk_error`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::warn;

use crate::errors::{Error, ErrorClass, Result};

/// Backoff curve and attempt caps
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed for a single operation, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// First delay after a credential-refresh failure
    pub credential_delay: Duration,
    pub credential_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            multiplier: 2,
            max_delay: Duration::from_secs(20),
            credential_delay: Duration::from_millis(250),
            credential_max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts of one operation, one per allowed retry
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        exponential(self.base_delay, self.multiplier, self.max_delay).take(self.retries())
    }

    /// Delays after credential-refresh failures
    pub fn credential_strategy(&self) -> impl Iterator<Item = Duration> {
        exponential(self.credential_delay, 2, self.credential_max_delay).take(self.retries())
    }

    /// Delay before re-attempt number `attempt` (1 = first retry)
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential(self.base_delay, self.multiplier, self.max_delay)
            .nth(attempt.saturating_sub(1).min(64) as usize)
            .unwrap_or(self.max_delay)
    }

    fn retries(&self) -> usize {
        self.max_attempts.saturating_sub(1) as usize
    }
}

/// `ExponentialBackoff` yields `multiplier^n * factor`, so the factor is
/// scaled down for the first delay to come out as `first`
fn exponential(first: Duration, multiplier: u32, cap: Duration) -> ExponentialBackoff {
    let multiplier = u64::from(multiplier.max(1));
    let first_ms = u64::try_from(first.as_millis()).unwrap_or(u64::MAX);
    ExponentialBackoff::from_millis(multiplier)
        .factor((first_ms / multiplier).max(1))
        .max_delay(cap)
}

/// Runs network operations under a retry policy
///
/// Clones share one retry counter, so a run hands a clone to every worker
/// and reads the total at the end.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    policy: RetryPolicy,
    retries: Arc<AtomicU64>,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries: Arc::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Re-attempts made by this supervisor and its clones
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts
    ///
    /// Running out of attempts is fatal for the operation and comes back as
    /// [`Error::RetriesExhausted`]. Retryable failures walk the normal curve;
    /// credential-refresh failures walk the short one.
    pub async fn run<T, F, Fut>(&self, operation: &str, worker: usize, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let credential_race = AtomicBool::new(false);

        let mut normal = self.policy.strategy();
        let mut credential = self.policy.credential_strategy();
        let delays = std::iter::from_fn(|| {
            if credential_race.load(Ordering::Relaxed) {
                credential.next()
            } else {
                normal.next()
            }
        });

        let action = || {
            attempts.fetch_add(1, Ordering::Relaxed);
            op()
        };

        let condition = |err: &Error| {
            let attempt = attempts.load(Ordering::Relaxed);
            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                return false;
            }
            credential_race.store(err.class() == ErrorClass::CredentialRefresh, Ordering::Relaxed);
            warn!(
                worker = worker,
                operation = %operation,
                attempt = attempt,
                code = err.code(),
                error = %err,
                "Retrying"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);
            true
        };

        match RetryIf::spawn(delays, action, condition).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_retryable() => Err(Error::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempts.load(Ordering::Relaxed),
                source: Box::new(err),
            }),
            Err(err) => Err(err),
        }
    }
}

const THROTTLING_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "Throttling",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
];

const TRANSIENT_CODES: &[&str] = &[
    "InternalServerError",
    "InternalError",
    "ServiceUnavailable",
    "RequestTimeout",
    "RequestTimeoutException",
    "TransactionInProgressException",
];

const CREDENTIAL_CODES: &[&str] = &["ExpiredTokenException", "ExpiredToken", "RequestExpired"];

const ACCESS_CODES: &[&str] = &[
    "AccessDeniedException",
    "AccessDenied",
    "UnrecognizedClientException",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
];

const MISSING_OBJECT_CODES: &[&str] = &["NoSuchBucket", "NoSuchKey", "NotFound"];

/// Map an SDK failure into the transfer error taxonomy
///
/// Works for any AWS service client since they share the smithy error types.
pub fn classify_sdk_error<E, R>(resource: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => Error::Transient(message),
        SdkError::DispatchFailure(_) | SdkError::ConstructionFailure(_) => {
            if mentions_credentials(&message) {
                Error::CredentialRefresh(message)
            } else if matches!(err, SdkError::DispatchFailure(_)) {
                Error::Transient(message)
            } else {
                Error::Validation(message)
            }
        }
        SdkError::ServiceError(_) => classify_code(resource, err.code(), message),
        _ => Error::Database(message),
    }
}

fn classify_code(resource: &str, code: Option<&str>, message: String) -> Error {
    let Some(code) = code else {
        return Error::Transient(message);
    };
    if THROTTLING_CODES.contains(&code) {
        Error::Throttled(message)
    } else if TRANSIENT_CODES.contains(&code) {
        Error::Transient(message)
    } else if CREDENTIAL_CODES.contains(&code) {
        Error::CredentialRefresh(message)
    } else if ACCESS_CODES.contains(&code) {
        Error::AccessDenied(message)
    } else if code == "ResourceNotFoundException" {
        Error::TableNotFound(resource.to_string())
    } else if MISSING_OBJECT_CODES.contains(&code) {
        Error::ObjectStore(format!("{} not found: {}", resource, message))
    } else if code == "ValidationException" || code == "SerializationException" {
        Error::Validation(message)
    } else {
        Error::Database(message)
    }
}

fn mentions_credentials(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("credential") || lower.contains("expired token") || lower.contains("security token")
}
