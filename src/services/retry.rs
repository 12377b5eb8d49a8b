//! Per-call timeout and bounded exponential backoff

use super::ServiceError;
use crate::config::{RetryConfig, TimeoutConfig};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request-scoped limits shared by every external call of one retrieval
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// Context with the given time budget and a fresh token
    pub fn with_budget(budget: Duration) -> Self {
        Self::new(Instant::now() + budget, CancellationToken::new())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Retry policy for one kind of external call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound for a single attempt; also capped by the request deadline
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            multiplier: retry.multiplier,
            attempt_timeout,
        }
    }

    /// Policy for search and embedding calls
    pub fn for_calls(retry: &RetryConfig, timeouts: &TimeoutConfig) -> Self {
        Self::from_config(retry, timeouts.call())
    }

    /// Single attempt, no backoff
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            attempt_timeout,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of retries,
    /// hits the request deadline or is cancelled
    pub async fn run<T, F, Fut>(
        &self,
        service: &str,
        ctx: &CallContext,
        mut op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut retries = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            let remaining = ctx.remaining();
            if remaining.is_zero() {
                return Err(ServiceError::Timeout {
                    service: service.to_string(),
                    after_ms: 0,
                });
            }

            let budget = self.attempt_timeout.min(remaining);
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
                result = tokio::time::timeout(budget, op()) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ServiceError::Timeout {
                        service: service.to_string(),
                        after_ms: budget.as_millis() as u64,
                    }),
                },
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() || retries >= self.max_retries {
                return Err(err);
            }

            retries += 1;
            let delay = self.backoff(retries);
            if delay >= ctx.remaining() {
                return Err(err);
            }

            tracing::debug!(
                service,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
