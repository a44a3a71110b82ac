use std::{future::Future, time::Duration};

use axum::http::StatusCode;
use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;

/// Check if an HTTP status code indicates a retryable error
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Computes exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Delay before retry number `attempt + 1` (`attempt` is 0-based).
    ///
    /// `min(initial * multiplier^attempt, max)`, then scaled by a factor drawn
    /// uniformly from `[1 - jitter, 1 + jitter]`.
    pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let pow = config.backoff_multiplier.powi(attempt as i32);
        let delay_ms = ((config.initial_backoff_ms as f32 * pow) as u64).min(config.max_backoff_ms);

        let jitter = config.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0 {
            let mut rng = rand::rng();
            let jitter_scale: f32 = rng.random_range(-jitter..=jitter);
            let jitter_ms = (delay_ms as f32 * jitter_scale).round() as i64;
            let adjusted = (delay_ms as i64 + jitter_ms).max(0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Failed without being retried: the error was not retryable, or retries are off
    Failed(E),
    /// Every allowed attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Failed(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor;

impl RetryExecutor {
    /// Run `operation` until it succeeds, fails with an error `should_retry`
    /// rejects, or `max_retries` retries have been spent. The first attempt
    /// is not a retry, so at most `max_retries + 1` attempts are made.
    ///
    /// - `operation(attempt)`: perform one attempt (0-based)
    /// - `should_retry(&err, attempt)`: whether another attempt may help
    /// - `on_backoff(&err, delay, next_attempt)`: called before each backoff sleep
    pub async fn execute_with_retry<Op, Fut, T, E, ShouldRetry, OnBackoff>(
        config: &RetryConfig,
        mut operation: Op,
        should_retry: ShouldRetry,
        on_backoff: OnBackoff,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        ShouldRetry: Fn(&E, u32) -> bool,
        OnBackoff: Fn(&E, Duration, u32),
    {
        let mut attempt: u32 = 0;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !should_retry(&err, attempt) || config.max_retries == 0 {
                return Err(RetryError::Failed(err));
            }

            if attempt >= config.max_retries {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }

            let next_attempt = attempt + 1;
            let delay = BackoffCalculator::calculate_delay(config, attempt);
            debug!(
                attempt = attempt,
                next_attempt = next_attempt,
                delay_ms = delay.as_millis() as u64,
                "Retry backoff"
            );
            on_backoff(&err, delay, next_attempt);
            tokio::time::sleep(delay).await;

            attempt = next_attempt;
        }
    }
}
