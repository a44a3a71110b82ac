//! Admission control in front of worker selection.
//!
//! Two independent gates:
//! - an optional rate limiter (token bucket refilled at the configured rate),
//!   rejecting with `RateLimited` when empty
//! - a concurrency gate (token bucket with no refill) holding at most
//!   `max_concurrent_requests` permits, backed by a bounded wait queue
//!
//! A request that cannot get a concurrency permit immediately takes a queue
//! slot if one is free (`QueueFull` otherwise) and waits up to
//! `queue_timeout` for a permit (`QueueTimeout` otherwise). Slots and permits
//! are released on drop, so cancelled requests give them back.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::debug;

use super::{
    error::{RouterError, RouterResult},
    token_bucket::TokenBucket,
};

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub max_concurrent_requests: usize,
    /// 0 rejects immediately once the concurrency limit is reached
    pub queue_size: usize,
    pub queue_timeout: Duration,
    /// None disables rate limiting
    pub rate_limit_tokens_per_second: Option<usize>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 256,
            queue_size: 100,
            queue_timeout: Duration::from_secs(60),
            rate_limit_tokens_per_second: None,
        }
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    concurrency: TokenBucket,
    rate_limiter: Option<TokenBucket>,
    queued: Arc<AtomicUsize>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let concurrency = TokenBucket::new(config.max_concurrent_requests, 0);
        let rate_limiter = config
            .rate_limit_tokens_per_second
            .map(|rate| TokenBucket::new(rate, rate));
        Self {
            concurrency,
            rate_limiter,
            queued: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Requests currently waiting for a permit
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Requests currently holding a permit
    pub fn in_flight(&self) -> usize {
        let available = self.concurrency.available_tokens().floor() as usize;
        self.config.max_concurrent_requests.saturating_sub(available)
    }

    /// Admit one request, waiting in the queue if needed.
    pub async fn acquire(&self) -> RouterResult<AdmissionPermit> {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire(1.0) {
                debug!("Admission rejected: rate limit exceeded");
                return Err(RouterError::RateLimited);
            }
        }

        if self.concurrency.try_acquire(1.0) {
            return Ok(self.permit());
        }

        let _slot = self.enter_queue()?;
        match self
            .concurrency
            .acquire_timeout(1.0, self.config.queue_timeout)
            .await
        {
            Ok(()) => Ok(self.permit()),
            Err(_) => {
                debug!(
                    timeout_ms = self.config.queue_timeout.as_millis() as u64,
                    "Admission rejected: queue wait timed out"
                );
                Err(RouterError::QueueTimeout(self.config.queue_timeout))
            }
        }
    }

    fn enter_queue(&self) -> RouterResult<QueueSlot> {
        let limit = self.config.queue_size;
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| {
                debug!(queue_size = limit, "Admission rejected: queue full");
                RouterError::QueueFull
            })?;
        Ok(QueueSlot {
            queued: Arc::clone(&self.queued),
        })
    }

    fn permit(&self) -> AdmissionPermit {
        AdmissionPermit {
            concurrency: self.concurrency.clone(),
        }
    }
}

/// A held concurrency slot; returned to the gate on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    concurrency: TokenBucket,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.concurrency.return_tokens(1.0);
    }
}

#[derive(Debug)]
struct QueueSlot {
    queued: Arc<AtomicUsize>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}
