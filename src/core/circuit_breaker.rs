use std::{
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures inside `window_duration` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open trial successes that close the circuit
    pub success_threshold: u32,
    /// Time spent open before a trial request is let through
    pub timeout_duration: Duration,
    /// Failures older than this no longer count toward `failure_threshold`
    pub window_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_duration: Duration::from_secs(30),
            window_duration: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::CircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(cfg: &crate::config::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            success_threshold: cfg.success_threshold,
            timeout_duration: Duration::from_secs(cfg.timeout_duration_secs),
            window_duration: Duration::from_secs(cfg.window_duration_secs),
        }
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// A single trial request at a time probes recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn to_int(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_int(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Right to dispatch granted by [`CircuitBreaker::can_execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    /// Admitted while closed
    Regular,
    /// The single half-open trial
    Trial,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        matches!(self, CircuitPermit::Trial)
    }
}

/// Milliseconds on a process-wide monotonic clock.
#[inline]
fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Per-worker circuit breaker built on atomics.
///
/// `is_available` is a read-only check used when filtering candidates, while
/// `can_execute` claims the right to dispatch. In the half-open state only one
/// caller at a time holds the trial permit, and only that caller's outcome can
/// close or reopen the circuit. The permit is handed back by its recorded
/// outcome or by `release` when a dispatch is abandoned.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    window_start_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    last_state_change_ms: AtomicU64,
    trial_in_flight: AtomicBool,
    config: CircuitBreakerConfig,
    label: String,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default(), String::new())
    }

    /// `label` identifies the worker in transition logs
    pub fn with_config(config: CircuitBreakerConfig, label: String) -> Self {
        let now = now_ms();
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(now),
            opened_at_ms: AtomicU64::new(0),
            last_state_change_ms: AtomicU64::new(now),
            trial_in_flight: AtomicBool::new(false),
            config,
            label,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, promoting Open to HalfOpen once the open timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let current = CircuitState::from_int(self.state.load(Ordering::Acquire));
        if current != CircuitState::Open {
            return current;
        }

        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let timeout_ms = self.config.timeout_duration.as_millis() as u64;
        if now_ms().saturating_sub(opened_at) < timeout_ms {
            return CircuitState::Open;
        }

        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_HALF_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.consecutive_successes.store(0, Ordering::Release);
            self.trial_in_flight.store(false, Ordering::Release);
            self.last_state_change_ms.store(now_ms(), Ordering::Release);
            info!(
                worker = %self.label,
                "Circuit breaker state transition: open -> half_open"
            );
            return CircuitState::HalfOpen;
        }
        CircuitState::from_int(self.state.load(Ordering::Acquire))
    }

    /// Whether a dispatch could currently be admitted, without claiming anything.
    #[inline]
    pub fn is_available(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Claim permission to dispatch. In half-open this takes the single trial
    /// permit; the returned permit must be handed back through one of the
    /// `record_*` calls or [`Self::release`].
    #[inline]
    pub fn can_execute(&self) -> Option<CircuitPermit> {
        match self.state() {
            CircuitState::Closed => Some(CircuitPermit::Regular),
            CircuitState::Open => None,
            CircuitState::HalfOpen => self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                .then_some(CircuitPermit::Trial),
        }
    }

    /// Give back a permit without an outcome (cancelled dispatch or a response
    /// that says nothing about worker health).
    pub fn release(&self, permit: CircuitPermit) {
        if permit.is_trial() {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    pub fn record_outcome(&self, permit: CircuitPermit, success: bool) {
        if success {
            self.record_success(permit);
        } else {
            self.record_failure(permit);
        }
    }

    /// Only the trial holder moves a half-open circuit; outcomes of dispatches
    /// admitted before the circuit opened are counted in the totals alone.
    pub fn record_success(&self, permit: CircuitPermit) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        match CircuitState::from_int(self.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen if permit.is_trial() => {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
                self.trial_in_flight.store(false, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                debug!(worker = %self.label, "Ignoring stale success while half-open");
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::Open => {
                debug!(worker = %self.label, "Success recorded while circuit is open");
            }
        }
    }

    pub fn record_failure(&self, permit: CircuitPermit) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        match CircuitState::from_int(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let now = now_ms();
                let window_ms = self.config.window_duration.as_millis() as u64;
                let window_start = self.window_start_ms.load(Ordering::Acquire);
                if now.saturating_sub(window_start) > window_ms {
                    self.window_start_ms.store(now, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                }

                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures == 1 {
                    self.window_start_ms.store(now, Ordering::Release);
                }
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if permit.is_trial() => {
                self.transition_to(CircuitState::Open);
                self.trial_in_flight.store(false, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                debug!(worker = %self.label, "Ignoring stale failure while half-open");
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old_state = CircuitState::from_int(self.state.swap(new_state.to_int(), Ordering::AcqRel));
        if old_state == new_state {
            return;
        }

        let now = now_ms();
        self.last_state_change_ms.store(now, Ordering::Release);
        match new_state {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.consecutive_successes.store(0, Ordering::Release);
                self.window_start_ms.store(now, Ordering::Release);
            }
            CircuitState::Open => {
                self.opened_at_ms.store(now, Ordering::Release);
                self.consecutive_successes.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes.store(0, Ordering::Release);
            }
        }

        if new_state == CircuitState::Open {
            warn!(
                worker = %self.label,
                "Circuit breaker state transition: {} -> {}", old_state, new_state
            );
        } else {
            info!(
                worker = %self.label,
                "Circuit breaker state transition: {} -> {}", old_state, new_state
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    pub fn time_since_last_state_change(&self) -> Duration {
        let last = self.last_state_change_ms.load(Ordering::Acquire);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    /// Back to Closed with all counters cleared
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Open immediately regardless of failure history
    pub fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            consecutive_successes: self.consecutive_successes(),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            time_since_last_state_change: self.time_since_last_state_change(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub time_since_last_state_change: Duration,
}
