//! Timeout and retry wrapper for provider calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::ResourceAddress;
use crate::config::SettingsConfig;
use crate::error::{ApplyError, ProviderError};
use crate::provider::ProviderFailure;

/// How provider calls are bounded and retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
    /// Delay growth factor.
    pub multiplier: f64,
    /// Budget of a single attempt.
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SettingsConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy from engine settings.
    #[must_use]
    pub fn from_settings(settings: &SettingsConfig) -> Self {
        Self {
            max_attempts: settings.retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.retry.max_backoff_ms),
            multiplier: settings.retry.multiplier,
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
        }
    }

    /// Delay after the given failed attempt, counting from 1.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        if !factor.is_finite() {
            return self.max_backoff;
        }
        self.initial_backoff.mul_f64(factor).min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails with an error that is not
    /// retryable, or runs out of attempts.
    ///
    /// Each attempt is bounded by `operation_timeout`; a timeout is not
    /// retried. Backoff sleeps end early when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::OperationFailed`] for a fatal error, timeout or
    /// cancellation, and [`ApplyError::RetriesExhausted`] when every attempt
    /// failed with a retryable error. Both carry the partial object of the
    /// last attempt.
    pub async fn run<T, F, Fut>(
        &self,
        address: &ResourceAddress,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, ApplyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderFailure>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let failure = match tokio::time::timeout(self.operation_timeout, call()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(address = %address, "{operation} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Ok(Err(failure)) => failure,
                Err(_) => ProviderFailure::new(ProviderError::Timeout {
                    secs: self.operation_timeout.as_secs(),
                }),
            };

            if !failure.error.is_retryable() {
                return Err(ApplyError::OperationFailed {
                    address: address.clone(),
                    operation,
                    source: failure.error,
                    partial: failure.partial.map(Box::new),
                });
            }

            if attempt >= self.max_attempts {
                return Err(ApplyError::RetriesExhausted {
                    address: address.clone(),
                    operation,
                    attempts: attempt,
                    last: failure.error,
                    partial: failure.partial.map(Box::new),
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                address = %address,
                "{operation} failed ({}), retrying in {delay:?} (attempt {attempt}/{})",
                failure.error,
                self.max_attempts
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ApplyError::OperationFailed {
                        address: address.clone(),
                        operation,
                        source: ProviderError::Cancelled,
                        partial: failure.partial.map(Box::new),
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, ObjectState, OperationRequest, Provider};
    use crate::value::Attributes;
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            operation_timeout: Duration::from_secs(5),
        }
    }

    fn request() -> OperationRequest {
        OperationRequest {
            address: ResourceAddress::new("null_resource", "a"),
            prior: None,
            planned: Attributes::new(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..fast(5)
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(60), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried_until_success() {
        let mut mock = MockProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_create()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(ProviderError::retryable("throttled").into()));
        mock.expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ObjectState::default()));
        let provider: Arc<dyn Provider> = Arc::new(mock);

        let address = ResourceAddress::new("null_resource", "a");
        let result = fast(5)
            .run(&address, "create", &CancellationToken::new(), || provider.create(request()))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let mut mock = MockProvider::new();
        mock.expect_create()
            .times(1)
            .returning(|_| Err(ProviderError::fatal("bad request").into()));
        let provider: Arc<dyn Provider> = Arc::new(mock);

        let address = ResourceAddress::new("null_resource", "a");
        let err = fast(5)
            .run(&address, "create", &CancellationToken::new(), || provider.create(request()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::OperationFailed { source: ProviderError::Fatal { .. }, .. }));
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_partial_state() {
        let mut mock = MockProvider::new();
        mock.expect_create().times(3).returning(|_| {
            Err(ProviderFailure::with_partial(
                ProviderError::retryable("eventual consistency"),
                ObjectState::default(),
            ))
        });
        let provider: Arc<dyn Provider> = Arc::new(mock);

        let address = ResourceAddress::new("null_resource", "a");
        let err = fast(3)
            .run(&address, "create", &CancellationToken::new(), || provider.create(request()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.partial().is_some());
    }

    #[tokio::test]
    async fn test_timeout_is_fatal() {
        let policy = RetryPolicy {
            operation_timeout: Duration::from_millis(10),
            ..fast(5)
        };
        let address = ResourceAddress::new("null_resource", "a");
        let mut calls = 0;
        let err = policy
            .run(&address, "create", &CancellationToken::new(), || {
                calls += 1;
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, ProviderFailure>(())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, ApplyError::OperationFailed { source: ProviderError::Timeout { .. }, .. }));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            ..fast(5)
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let address = ResourceAddress::new("null_resource", "a");
        let err = policy
            .run(&address, "create", &cancel, || async {
                Err::<(), _>(ProviderFailure::new(ProviderError::retryable("busy")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::OperationFailed { source: ProviderError::Cancelled, .. }));
    }
}
