//! Bounded retry with a fixed backoff for outbound deliveries.
//!
//! Every attempt outcome is recorded on the channel's [`ContactHealth`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::health::ContactHealth;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per message, first one included (default: 3).
    pub max_attempts: u32,
    /// Wait between attempts (default: 30 seconds).
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(30),
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// All attempts failed, or the error was permanent.
    Exhausted {
        /// The last error that occurred.
        last_error: TransportError,
        /// Total number of attempts made.
        attempts: u32,
    },
    /// The cancellation token fired while waiting to retry.
    Cancelled,
}

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget runs out, sleeping the fixed backoff between attempts.
    pub async fn execute_with_health<F, Fut, T>(
        &self,
        health: &ContactHealth,
        cancel: &CancellationToken,
        operation: F,
    ) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    health.record_success();
                    return RetryOutcome::Success(value);
                }
                Err(e) => {
                    health.record_failure();
                    if !is_retryable(&e) || attempt >= max_attempts {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    tracing::debug!(attempt, error = %e, "delivery failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                        _ = tokio::time::sleep(self.config.backoff) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Returns true for failures worth another attempt.
///
/// Network-level failures are transient. Malformed messages, validation
/// errors and shutdown are permanent.
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::ConnectionRefused { .. } => true,
        TransportError::ConnectionTimeout { .. } => true,
        TransportError::ReadTimeout { .. } => true,
        TransportError::IoError(_) => true,
        TransportError::InvalidMessage { .. } => false,
        TransportError::UnknownOperation { .. } => false,
        TransportError::InvalidAddress(_) => false,
        TransportError::InvalidTest { .. } => false,
        TransportError::DuplicateTest(_) => false,
        TransportError::UnknownTest(_) => false,
        TransportError::FileUnavailable { .. } => false,
        TransportError::Shutdown(_) => false,
    }
}
