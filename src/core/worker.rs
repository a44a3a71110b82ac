use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit},
    prefix_cache::PrefixCache,
};
use crate::config::HealthCheckConfig;

/// Default bound on prefix-cache entries per worker
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;

/// Smoothing factor for the latency moving average
const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// Stable, unique worker identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which pool a worker serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    Unified,
    Prefill,
    Decode,
}

impl PoolRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolRole::Unified => "unified",
            PoolRole::Prefill => "prefill",
            PoolRole::Decode => "decode",
        }
    }
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_HEALTHY: u8 = 1;
const HEALTH_UNHEALTHY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not probed yet; eligible only when no Healthy worker is
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    fn to_int(self) -> u8 {
        match self {
            HealthStatus::Unknown => HEALTH_UNKNOWN,
            HealthStatus::Healthy => HEALTH_HEALTHY,
            HealthStatus::Unhealthy => HEALTH_UNHEALTHY,
        }
    }

    fn from_int(v: u8) -> Self {
        match v {
            HEALTH_HEALTHY => HealthStatus::Healthy,
            HEALTH_UNHEALTHY => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one dispatch, as seen by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 2xx/3xx
    Success,
    /// 4xx: the worker answered correctly, the request was bad. Neutral for
    /// the breaker.
    ClientError,
    /// Transport error, timeout or 5xx
    Failure,
}

impl DispatchOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            DispatchOutcome::Failure
        } else if status.is_client_error() {
            DispatchOutcome::ClientError
        } else {
            DispatchOutcome::Success
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DispatchOutcome::Failure)
    }
}

/// A backend model-serving worker and its live state.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    url: String,
    role: PoolRole,
    bootstrap_port: Option<u16>,
    health: AtomicU8,
    consecutive_probe_failures: AtomicU32,
    consecutive_probe_successes: AtomicU32,
    active_requests: AtomicUsize,
    processed: AtomicU64,
    /// EWMA of response time in microseconds, 0 until the first sample
    latency_ewma_us: AtomicU64,
    circuit_breaker: CircuitBreaker,
    prefix_cache: PrefixCache,
    health_config: HealthCheckConfig,
}

impl Worker {
    pub fn builder(url: impl Into<String>) -> WorkerBuilder {
        WorkerBuilder::new(url)
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn bootstrap_port(&self) -> Option<u16> {
        self.bootstrap_port
    }

    pub fn health_config(&self) -> &HealthCheckConfig {
        &self.health_config
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_int(self.health.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthStatus::Healthy
    }

    pub fn set_health(&self, status: HealthStatus) {
        let old = HealthStatus::from_int(self.health.swap(status.to_int(), Ordering::AcqRel));
        if old != status {
            match status {
                HealthStatus::Unhealthy => {
                    warn!(worker_id = %self.id, url = %self.url, "Worker health: {} -> {}", old, status)
                }
                _ => {
                    info!(worker_id = %self.id, url = %self.url, "Worker health: {} -> {}", old, status)
                }
            }
        }
    }

    /// Not Unhealthy and the circuit would admit a request
    pub fn is_eligible(&self) -> bool {
        self.health() != HealthStatus::Unhealthy && self.circuit_breaker.is_available()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn load(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn increment_load(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_load(&self) {
        if self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(1)
            })
            .is_err()
        {
            warn!(
                worker_url = %self.url,
                "Attempted to decrement load counter that is already at 0"
            );
        }
    }

    pub fn processed_requests(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn latency_estimate(&self) -> Option<Duration> {
        match self.latency_ewma_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn record_latency(&self, latency: Duration) {
        let sample = (latency.as_micros() as u64).max(1);
        let _ = self
            .latency_ewma_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                if old == 0 {
                    Some(sample)
                } else {
                    let blended = old as f64 * (1.0 - LATENCY_EWMA_ALPHA)
                        + sample as f64 * LATENCY_EWMA_ALPHA;
                    Some((blended as u64).max(1))
                }
            });
    }

    /// Feed a finished dispatch into the breaker and latency estimate.
    fn record_outcome(&self, permit: CircuitPermit, outcome: DispatchOutcome, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            DispatchOutcome::Success => {
                self.record_latency(latency);
                self.circuit_breaker.record_success(permit);
            }
            DispatchOutcome::ClientError => {
                self.record_latency(latency);
                self.circuit_breaker.release(permit);
            }
            DispatchOutcome::Failure => self.circuit_breaker.record_failure(permit),
        }
    }

    pub fn cache_score(&self, text: &str) -> f32 {
        self.prefix_cache.match_ratio(text)
    }

    pub fn record_cached_prefix(&self, text: &str) {
        self.prefix_cache.insert(text);
    }

    pub fn prefix_cache(&self) -> &PrefixCache {
        &self.prefix_cache
    }

    /// Claim a breaker permit and count the request as in flight.
    ///
    /// Returns `None` when the circuit rejects the dispatch.
    pub fn try_start_dispatch(self: &Arc<Self>) -> Option<DispatchGuard> {
        let permit = self.circuit_breaker.can_execute()?;
        self.increment_load();
        Some(DispatchGuard {
            worker: Arc::clone(self),
            permit,
            started: Instant::now(),
            finished: false,
        })
    }

    /// Apply one probe result to the consecutive counters and health state.
    pub fn record_probe(&self, healthy: bool) {
        if healthy {
            self.consecutive_probe_failures.store(0, Ordering::Release);
            let successes = self.consecutive_probe_successes.fetch_add(1, Ordering::AcqRel) + 1;
            match self.health() {
                HealthStatus::Unknown => self.set_health(HealthStatus::Healthy),
                HealthStatus::Unhealthy if successes >= self.health_config.success_threshold => {
                    self.set_health(HealthStatus::Healthy);
                    self.consecutive_probe_successes.store(0, Ordering::Release);
                }
                _ => {}
            }
        } else {
            self.consecutive_probe_successes.store(0, Ordering::Release);
            let failures = self.consecutive_probe_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if self.health() != HealthStatus::Unhealthy
                && failures >= self.health_config.failure_threshold
            {
                self.set_health(HealthStatus::Unhealthy);
                self.consecutive_probe_failures.store(0, Ordering::Release);
            }
        }
    }

    /// Probe the health endpoint once and apply the result.
    pub async fn check_health(&self, client: &reqwest::Client) -> bool {
        let healthy = self.probe(client).await;
        self.record_probe(healthy);
        healthy
    }

    async fn probe(&self, client: &reqwest::Client) -> bool {
        let health_url = format!(
            "{}{}",
            self.url.trim_end_matches('/'),
            self.health_config.endpoint
        );
        let timeout = Duration::from_secs(self.health_config.timeout_secs);

        match client.get(&health_url).timeout(timeout).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    debug!(url = %health_url, status = %resp.status(), "Health probe returned error status");
                }
                ok
            }
            Err(err) => {
                debug!(url = %health_url, "Health probe failed: {}", err);
                false
            }
        }
    }
}

/// Keeps a worker's in-flight count raised for the lifetime of one dispatch.
///
/// `finish` records the outcome; dropping an unfinished guard (cancellation)
/// only lowers the count and hands back a half-open trial permit.
#[derive(Debug)]
pub struct DispatchGuard {
    worker: Arc<Worker>,
    permit: CircuitPermit,
    started: Instant,
    finished: bool,
}

impl DispatchGuard {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.worker.id()
    }

    /// Whether this dispatch is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.permit.is_trial()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self, outcome: DispatchOutcome) {
        self.finished = true;
        self.worker.decrement_load();
        self.worker
            .record_outcome(self.permit, outcome, self.started.elapsed());
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.worker.decrement_load();
            self.worker.circuit_breaker.release(self.permit);
        }
    }
}

/// Builder for [`Worker`]
#[derive(Debug)]
pub struct WorkerBuilder {
    url: String,
    id: Option<WorkerId>,
    role: PoolRole,
    bootstrap_port: Option<u16>,
    health: HealthStatus,
    health_config: HealthCheckConfig,
    circuit_breaker_config: CircuitBreakerConfig,
    max_cache_entries: usize,
}

impl WorkerBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: None,
            role: PoolRole::Unified,
            bootstrap_port: None,
            health: HealthStatus::Unknown,
            health_config: HealthCheckConfig::default(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
        }
    }

    pub fn id(mut self, id: WorkerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn role(mut self, role: PoolRole) -> Self {
        self.role = role;
        self
    }

    pub fn bootstrap_port(mut self, port: Option<u16>) -> Self {
        self.bootstrap_port = port;
        self
    }

    pub fn health(mut self, status: HealthStatus) -> Self {
        self.health = status;
        self
    }

    pub fn health_config(mut self, config: HealthCheckConfig) -> Self {
        self.health_config = config;
        self
    }

    pub fn circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    pub fn max_cache_entries(mut self, max: usize) -> Self {
        self.max_cache_entries = max;
        self
    }

    pub fn build(self) -> Worker {
        let label = self.url.clone();
        Worker {
            id: self.id.unwrap_or_default(),
            url: self.url,
            role: self.role,
            bootstrap_port: self.bootstrap_port,
            health: AtomicU8::new(self.health.to_int()),
            consecutive_probe_failures: AtomicU32::new(0),
            consecutive_probe_successes: AtomicU32::new(0),
            active_requests: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            latency_ewma_us: AtomicU64::new(0),
            circuit_breaker: CircuitBreaker::with_config(self.circuit_breaker_config, label),
            prefix_cache: PrefixCache::new(self.max_cache_entries),
            health_config: self.health_config,
        }
    }
}
