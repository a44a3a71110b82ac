use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::AdmissionConfig;

/// Main router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Routing mode configuration
    pub mode: RoutingMode,
    /// Policy configuration (shared default for every pool)
    pub policy: PolicyConfig,
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Whole-request timeout in seconds, admission wait included
    pub request_timeout_secs: u64,
    /// How long startup waits for workers to become healthy
    pub worker_startup_timeout_secs: u64,
    /// Poll interval while waiting for workers at startup
    pub worker_startup_check_interval_secs: u64,
    /// Service discovery configuration (optional)
    pub discovery: Option<DiscoveryConfig>,
    /// Log directory (None = stdout only)
    pub log_dir: Option<String>,
    /// Log level (None = info)
    pub log_level: Option<String>,
    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,
    /// Maximum concurrent requests admitted to routing
    pub max_concurrent_requests: usize,
    /// Queue size for pending requests when max concurrent limit reached (0 = no queue, return 429 immediately)
    pub queue_size: usize,
    /// Maximum time (in seconds) a request can wait in queue before timing out
    pub queue_timeout_secs: u64,
    /// Token bucket refill rate (tokens per second). None disables rate limiting
    pub rate_limit_tokens_per_second: Option<usize>,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Disable retries (overrides retry.max_retries to 0 when true)
    #[serde(default)]
    pub disable_retries: bool,
    /// Disable circuit breaker (overrides circuit_breaker.failure_threshold to u32::MAX when true)
    #[serde(default)]
    pub disable_circuit_breaker: bool,
    /// Health check configuration
    pub health_check: HealthCheckConfig,
}

/// Routing mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoutingMode {
    #[serde(rename = "regular")]
    Regular {
        /// List of worker URLs
        worker_urls: Vec<String>,
    },
    #[serde(rename = "prefill_decode")]
    PrefillDecode {
        /// Prefill worker URLs with optional bootstrap ports
        prefill_urls: Vec<(String, Option<u16>)>,
        /// Decode worker URLs
        decode_urls: Vec<String>,
        /// Optional separate policy for prefill workers
        #[serde(skip_serializing_if = "Option::is_none")]
        prefill_policy: Option<PolicyConfig>,
        /// Optional separate policy for decode workers
        #[serde(skip_serializing_if = "Option::is_none")]
        decode_policy: Option<PolicyConfig>,
    },
}

impl RoutingMode {
    pub fn is_pd_mode(&self) -> bool {
        matches!(self, RoutingMode::PrefillDecode { .. })
    }

    pub fn worker_count(&self) -> usize {
        match self {
            RoutingMode::Regular { worker_urls } => worker_urls.len(),
            RoutingMode::PrefillDecode {
                prefill_urls,
                decode_urls,
                ..
            } => prefill_urls.len() + decode_urls.len(),
        }
    }

    /// Get the effective prefill policy for PD mode
    /// Falls back to the main policy if no specific prefill policy is set
    pub fn get_prefill_policy<'a>(&'a self, main_policy: &'a PolicyConfig) -> &'a PolicyConfig {
        match self {
            RoutingMode::PrefillDecode { prefill_policy, .. } => {
                prefill_policy.as_ref().unwrap_or(main_policy)
            }
            _ => main_policy,
        }
    }

    /// Get the effective decode policy for PD mode
    /// Falls back to the main policy if no specific decode policy is set
    pub fn get_decode_policy<'a>(&'a self, main_policy: &'a PolicyConfig) -> &'a PolicyConfig {
        match self {
            RoutingMode::PrefillDecode { decode_policy, .. } => {
                decode_policy.as_ref().unwrap_or(main_policy)
            }
            _ => main_policy,
        }
    }
}

/// Policy configuration for routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PolicyConfig {
    #[serde(rename = "random")]
    Random,

    #[serde(rename = "round_robin")]
    RoundRobin,

    #[serde(rename = "cache_aware")]
    CacheAware {
        /// Minimum prefix match ratio to use cache-based routing
        cache_threshold: f32,
        /// Absolute load difference threshold for load balancing
        balance_abs_threshold: usize,
        /// Relative load ratio threshold for load balancing
        balance_rel_threshold: f32,
        /// Maximum prefix-cache entries per worker
        max_tree_size: usize,
    },

    #[serde(rename = "power_of_two")]
    PowerOfTwo,

    #[serde(rename = "consistent_hash")]
    ConsistentHash,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::CacheAware {
            cache_threshold: 0.5,
            balance_abs_threshold: 32,
            balance_rel_threshold: 1.1,
            max_tree_size: 10_000,
        }
    }
}

impl PolicyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyConfig::Random => "random",
            PolicyConfig::RoundRobin => "round_robin",
            PolicyConfig::CacheAware { .. } => "cache_aware",
            PolicyConfig::PowerOfTwo => "power_of_two",
            PolicyConfig::ConsistentHash => "consistent_hash",
        }
    }

    /// Prefix-cache bound for workers routed by this policy
    pub fn max_tree_size(&self) -> Option<usize> {
        match self {
            PolicyConfig::CacheAware { max_tree_size, .. } => Some(*max_tree_size),
            _ => None,
        }
    }
}

/// Which policies a PD deployment actually uses, and what to tell the operator about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyNotice {
    /// Both pools use the main policy
    Shared,
    /// Both per-role policies are set; the main policy is unused
    PerRoleOverride,
    /// Only the prefill policy is set; decode uses the main policy
    PrefillOverride,
    /// Only the decode policy is set; prefill uses the main policy
    DecodeOverride,
}

#[derive(Debug, Clone)]
pub struct PdPolicyResolution {
    pub prefill: PolicyConfig,
    pub decode: PolicyConfig,
    pub main: PolicyConfig,
    pub notice: PolicyNotice,
}

impl PdPolicyResolution {
    pub fn resolve(
        main: &PolicyConfig,
        prefill_policy: Option<&PolicyConfig>,
        decode_policy: Option<&PolicyConfig>,
    ) -> Self {
        let notice = match (prefill_policy, decode_policy) {
            (Some(_), Some(_)) => PolicyNotice::PerRoleOverride,
            (Some(_), None) => PolicyNotice::PrefillOverride,
            (None, Some(_)) => PolicyNotice::DecodeOverride,
            (None, None) => PolicyNotice::Shared,
        };
        Self {
            prefill: prefill_policy.unwrap_or(main).clone(),
            decode: decode_policy.unwrap_or(main).clone(),
            main: main.clone(),
            notice,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self.notice {
            PolicyNotice::Shared => None,
            PolicyNotice::PerRoleOverride => Some(format!(
                "Both --prefill-policy and --decode-policy are specified. \
                 The main --policy flag ('{}') will be ignored for PD mode.",
                self.main.name()
            )),
            PolicyNotice::PrefillOverride => Some(format!(
                "Using --prefill-policy '{}' for prefill nodes and --policy '{}' for decode nodes.",
                self.prefill.name(),
                self.main.name()
            )),
            PolicyNotice::DecodeOverride => Some(format!(
                "Using --policy '{}' for prefill nodes and --decode-policy '{}' for decode nodes.",
                self.main.name(),
                self.decode.name()
            )),
        }
    }

    /// Surface the notice: a warning when the main policy is overridden
    /// entirely, an informational line when only one role overrides it.
    pub fn log(&self) {
        let Some(message) = self.message() else {
            return;
        };
        match self.notice {
            PolicyNotice::PerRoleOverride => warn!("{}", message),
            _ => info!("{}", message),
        }
    }
}

/// Service discovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Workers may arrive later through registration events
    pub enabled: bool,
}

/// Retry configuration for request handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Jitter factor applied to backoff (0.0 - 1.0)
    /// Effective delay D' = D * (1 + U[-j, +j])
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

fn default_retry_jitter_factor() -> f32 {
    0.1
}

/// Health check configuration for worker monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Number of consecutive failures before marking unhealthy
    pub failure_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub success_threshold: u32,
    /// Timeout for health check requests in seconds
    pub timeout_secs: u64,
    /// Interval between health checks in seconds
    pub check_interval_secs: u64,
    /// Health check endpoint path
    pub endpoint: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_secs: 5,
            check_interval_secs: 30,
            endpoint: "/health".to_string(),
        }
    }
}

/// Circuit breaker configuration for worker reliability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes before closing circuit
    pub success_threshold: u32,
    /// Time before attempting to recover from open state (in seconds)
    pub timeout_duration_secs: u64,
    /// Window duration for failure tracking (in seconds)
    pub window_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_duration_secs: 30,
            window_duration_secs: 60,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::Regular {
                worker_urls: vec![],
            },
            policy: PolicyConfig::default(),
            host: "0.0.0.0".to_string(),
            port: 3001,
            request_timeout_secs: 1800,
            worker_startup_timeout_secs: 600,
            worker_startup_check_interval_secs: 10,
            discovery: None,
            log_dir: None,
            log_level: None,
            log_json: false,
            max_concurrent_requests: 256,
            queue_size: 100,
            queue_timeout_secs: 60,
            rate_limit_tokens_per_second: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            disable_retries: false,
            disable_circuit_breaker: false,
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Create a new configuration with mode and policy
    pub fn new(mode: RoutingMode, policy: PolicyConfig) -> Self {
        Self {
            mode,
            policy,
            ..Default::default()
        }
    }

    pub fn is_pd_mode(&self) -> bool {
        self.mode.is_pd_mode()
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery.as_ref().is_some_and(|d| d.enabled)
    }

    /// Retry settings with `disable_retries` applied
    pub fn effective_retry_config(&self) -> RetryConfig {
        let mut cfg = self.retry.clone();
        if self.disable_retries {
            cfg.max_retries = 0;
        }
        cfg
    }

    /// Breaker settings with `disable_circuit_breaker` applied
    pub fn effective_circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let mut cfg = self.circuit_breaker.clone();
        if self.disable_circuit_breaker {
            cfg.failure_threshold = u32::MAX;
        }
        cfg
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            queue_size: self.queue_size,
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
            rate_limit_tokens_per_second: self.rate_limit_tokens_per_second,
        }
    }

    /// Policies for each PD pool; in regular mode both sides are the main policy.
    pub fn pd_policy_resolution(&self) -> PdPolicyResolution {
        match &self.mode {
            RoutingMode::PrefillDecode {
                prefill_policy,
                decode_policy,
                ..
            } => PdPolicyResolution::resolve(
                &self.policy,
                prefill_policy.as_ref(),
                decode_policy.as_ref(),
            ),
            RoutingMode::Regular { .. } => PdPolicyResolution::resolve(&self.policy, None, None),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pd_mode(prefill: Option<PolicyConfig>, decode: Option<PolicyConfig>) -> RoutingMode {
        RoutingMode::PrefillDecode {
            prefill_urls: vec![("http://prefill1:8000".to_string(), None)],
            decode_urls: vec!["http://decode1:8001".to_string()],
            prefill_policy: prefill,
            decode_policy: decode,
        }
    }

    #[test]
    fn test_router_config_default() {
        let config = RouterConfig::default();

        assert!(
            matches!(config.mode, RoutingMode::Regular { worker_urls } if worker_urls.is_empty())
        );
        assert_eq!(config.policy.name(), "cache_aware");
        assert_eq!(config.port, 3001);
        assert_eq!(config.max_concurrent_requests, 256);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.queue_timeout_secs, 60);
        assert!(config.rate_limit_tokens_per_second.is_none());
        assert!(config.discovery.is_none());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_nested_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_backoff_ms, 100);
        assert_eq!(retry.max_backoff_ms, 10_000);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(retry.jitter_factor, 0.1);

        let cb = CircuitBreakerConfig::default();
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.success_threshold, 2);
        assert_eq!(cb.timeout_duration_secs, 30);
        assert_eq!(cb.window_duration_secs, 60);

        let health = HealthCheckConfig::default();
        assert_eq!(health.failure_threshold, 3);
        assert_eq!(health.success_threshold, 2);
        assert_eq!(health.timeout_secs, 5);
        assert_eq!(health.check_interval_secs, 30);
        assert_eq!(health.endpoint, "/health");

        match PolicyConfig::default() {
            PolicyConfig::CacheAware {
                cache_threshold,
                balance_abs_threshold,
                balance_rel_threshold,
                max_tree_size,
            } => {
                assert_eq!(cache_threshold, 0.5);
                assert_eq!(balance_abs_threshold, 32);
                assert_eq!(balance_rel_threshold, 1.1);
                assert_eq!(max_tree_size, 10_000);
            }
            other => panic!("unexpected default policy {:?}", other),
        }
    }

    #[test]
    fn test_router_config_serialization() {
        let config = RouterConfig {
            mode: pd_mode(Some(PolicyConfig::PowerOfTwo), None),
            policy: PolicyConfig::ConsistentHash,
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"prefill_decode\""));
        assert!(json.contains("\"type\":\"consistent_hash\""));

        let deserialized: RouterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.policy, PolicyConfig::ConsistentHash);
        assert_eq!(
            deserialized.mode.get_prefill_policy(&deserialized.policy),
            &PolicyConfig::PowerOfTwo
        );
        assert_eq!(deserialized.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_disable_flags_override_nested_configs() {
        let config = RouterConfig {
            disable_retries: true,
            disable_circuit_breaker: true,
            ..Default::default()
        };
        assert_eq!(config.effective_retry_config().max_retries, 0);
        assert_eq!(
            config.effective_circuit_breaker_config().failure_threshold,
            u32::MAX
        );

        let config = RouterConfig::default();
        assert_eq!(config.effective_retry_config().max_retries, 3);
        assert_eq!(config.effective_circuit_breaker_config().failure_threshold, 5);
    }

    #[test]
    fn test_pd_policy_both_overrides_warns() {
        let config = RouterConfig::new(
            pd_mode(Some(PolicyConfig::PowerOfTwo), Some(PolicyConfig::RoundRobin)),
            PolicyConfig::default(),
        );
        let resolution = config.pd_policy_resolution();
        assert_eq!(resolution.notice, PolicyNotice::PerRoleOverride);
        assert_eq!(resolution.prefill, PolicyConfig::PowerOfTwo);
        assert_eq!(resolution.decode, PolicyConfig::RoundRobin);
        assert!(resolution
            .message()
            .unwrap()
            .contains("Both --prefill-policy and --decode-policy are specified"));
    }

    #[test]
    fn test_pd_policy_prefill_only() {
        let config = RouterConfig::new(
            pd_mode(Some(PolicyConfig::PowerOfTwo), None),
            PolicyConfig::default(),
        );
        let resolution = config.pd_policy_resolution();
        assert_eq!(resolution.notice, PolicyNotice::PrefillOverride);
        assert_eq!(resolution.decode.name(), "cache_aware");
        let message = resolution.message().unwrap();
        assert!(message.contains("Using --prefill-policy 'power_of_two'"));
        assert!(message.contains("and --policy 'cache_aware'"));
    }

    #[test]
    fn test_pd_policy_decode_only() {
        let config = RouterConfig::new(
            pd_mode(None, Some(PolicyConfig::RoundRobin)),
            PolicyConfig::default(),
        );
        let resolution = config.pd_policy_resolution();
        assert_eq!(resolution.notice, PolicyNotice::DecodeOverride);
        assert_eq!(resolution.prefill.name(), "cache_aware");
        let message = resolution.message().unwrap();
        assert!(message.contains("Using --policy 'cache_aware'"));
        assert!(message.contains("and --decode-policy 'round_robin'"));
    }

    #[test]
    fn test_pd_policy_shared() {
        let config = RouterConfig::new(pd_mode(None, None), PolicyConfig::Random);
        let resolution = config.pd_policy_resolution();
        assert_eq!(resolution.notice, PolicyNotice::Shared);
        assert!(resolution.message().is_none());
        assert_eq!(resolution.prefill, PolicyConfig::Random);
        assert_eq!(resolution.decode, PolicyConfig::Random);
    }

    #[test]
    fn test_admission_config_mapping() {
        let config = RouterConfig {
            max_concurrent_requests: 8,
            queue_size: 4,
            queue_timeout_secs: 2,
            rate_limit_tokens_per_second: Some(50),
            ..Default::default()
        };
        let admission = config.admission_config();
        assert_eq!(admission.max_concurrent_requests, 8);
        assert_eq!(admission.queue_size, 4);
        assert_eq!(admission.queue_timeout, Duration::from_secs(2));
        assert_eq!(admission.rate_limit_tokens_per_second, Some(50));
    }
}
