use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Token bucket used both as a rate limiter and as a concurrency gate.
///
/// With `refill_rate == 0` tokens only come back through [`Self::return_tokens`],
/// which makes the bucket a plain counting semaphore. Returning tokens is sync
/// so it can run from `Drop`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<TokenBucketInner>>,
    notify: Arc<Notify>,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
}

#[derive(Debug)]
struct TokenBucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketInner {
    fn refill(&mut self, capacity: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// `capacity` is the burst size; `refill_rate` may be 0.
    pub fn new(capacity: usize, refill_rate: usize) -> Self {
        let capacity = capacity as f64;
        Self {
            inner: Arc::new(Mutex::new(TokenBucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            notify: Arc::new(Notify::new()),
            capacity,
            refill_rate: refill_rate as f64,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Take `tokens` if they are available right now.
    pub fn try_acquire(&self, tokens: f64) -> bool {
        let mut inner = self.inner.lock();
        inner.refill(self.capacity, self.refill_rate);

        trace!(
            available = inner.tokens,
            requested = tokens,
            "Token bucket acquire"
        );

        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Wait until `tokens` can be taken.
    ///
    /// With `refill_rate == 0` this waits for returned tokens indefinitely;
    /// callers bound it with [`Self::acquire_timeout`].
    pub async fn acquire(&self, tokens: f64) {
        loop {
            // Register interest before checking so a return between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(tokens) {
                return;
            }

            if self.refill_rate == 0.0 {
                notified.await;
                continue;
            }

            let wait = {
                let inner = self.inner.lock();
                let missing = (tokens - inner.tokens).max(0.0);
                Duration::from_secs_f64(missing / self.refill_rate).max(Duration::from_millis(1))
            };
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    pub async fn acquire_timeout(
        &self,
        tokens: f64,
        timeout: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.acquire(tokens)).await
    }

    /// Put tokens back and wake waiters.
    pub fn return_tokens(&self, tokens: f64) {
        {
            let mut inner = self.inner.lock();
            inner.tokens = (inner.tokens + tokens).min(self.capacity);
        }
        self.notify.notify_waiters();
    }

    pub fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock();
        inner.refill(self.capacity, self.refill_rate);
        inner.tokens
    }
}
