//! Retry with exponential backoff, and retry-then-verify for calls whose
//! failure report may be wrong.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mender_types::{MenderError, Result};

use crate::backoff::BackoffPolicy;
use crate::breaker::CircuitBreakerRegistry;

/// Predicate deciding whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&MenderError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Overrides [`MenderError::is_retryable`] when set. Terminal errors are
    /// never retried, whatever the predicate says.
    pub retry_on: Option<RetryPredicate>,
    /// Wrap every attempt in this service's circuit breaker.
    pub service: Option<(String, Arc<CircuitBreakerRegistry>)>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            retry_on: None,
            service: None,
        }
    }
}

impl RetryOptions {
    pub fn with_service(mut self, service: impl Into<String>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.service = Some((service.into(), breakers));
        self
    }

    pub fn retry_on(mut self, predicate: impl Fn(&MenderError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::Exponential {
            base: self.initial_delay,
            factor: self.backoff_factor,
            max: self.max_delay,
        }
    }

    fn should_retry(&self, err: &MenderError) -> bool {
        if err.is_terminal() {
            return false;
        }
        match &self.retry_on {
            Some(predicate) => predicate(err),
            None => err.is_retryable(),
        }
    }
}

/// Call `f` up to `max_retries + 1` times, sleeping
/// `min(initial_delay * backoff_factor^(attempt-1), max_delay)` between attempts.
///
/// Returns the last error once attempts are exhausted or the predicate declines.
pub async fn with_retry<T, F, Fut>(mut f: F, opts: &RetryOptions) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = opts.backoff();
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let result = match &opts.service {
            Some((service, breakers)) => breakers.with_circuit_breaker(service, || f()).await,
            None => f().await,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt <= opts.max_retries && opts.should_retry(&e) => {
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Clone)]
pub struct VerifyOptions {
    pub retry: RetryOptions,
    /// Extra verification rounds after `with_retry` gives up.
    pub verify_attempts: usize,
    /// Round `n` waits `verify_delay * n` before checking.
    pub verify_delay: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            verify_attempts: 3,
            verify_delay: Duration::from_millis(2000),
        }
    }
}

/// Like [`with_retry`], but a reported failure is double-checked before it is
/// believed: the operation may have landed downstream even though its
/// acknowledgement was lost.
///
/// After retries are exhausted, each verification round asks `verify` about the
/// last observed result (if any), and if that is not confirmed invokes `f` once
/// more and verifies the fresh result. Resolves `Some(value)` when a confirmed
/// value exists and `None` when `verify` confirmed success without one. Only
/// after every round fails is the original error returned.
pub async fn with_retry_and_verify<T, F, Fut, V, VFut>(
    mut f: F,
    mut verify: V,
    opts: &VerifyOptions,
) -> Result<Option<T>>
where
    T: Clone,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    V: FnMut(Option<T>) -> VFut,
    VFut: Future<Output = bool>,
{
    let original = match with_retry(&mut f, &opts.retry).await {
        Ok(value) => return Ok(Some(value)),
        Err(e) => e,
    };

    let mut last: Option<T> = None;
    for round in 1..=opts.verify_attempts {
        tokio::time::sleep(opts.verify_delay.saturating_mul(round as u32)).await;

        if verify(last.clone()).await {
            tracing::info!(round, "Verification confirmed success after reported failure");
            return Ok(last);
        }

        match f().await {
            Ok(value) => {
                if verify(Some(value.clone())).await {
                    tracing::info!(round, "Re-invocation verified");
                    return Ok(Some(value));
                }
                last = Some(value);
            }
            Err(e) => {
                tracing::debug!(round, error = %e, "Verification round re-invocation failed");
            }
        }
    }

    tracing::warn!(rounds = opts.verify_attempts, error = %original, "Verification exhausted");
    Err(original)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
