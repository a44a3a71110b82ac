use super::*;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Run every check; the first violation is returned.
    pub fn validate(config: &RouterConfig) -> ConfigResult<()> {
        Self::validate_mode(&config.mode)?;
        Self::validate_policy(&config.policy)?;
        Self::validate_server_settings(config)?;
        Self::validate_pd_topology(config)?;
        Self::validate_compatibility(config)?;

        let retry_cfg = config.effective_retry_config();
        let cb_cfg = config.effective_circuit_breaker_config();
        Self::validate_retry(&retry_cfg)?;
        Self::validate_circuit_breaker(&cb_cfg)?;
        Self::validate_health_check(&config.health_check)?;

        Ok(())
    }

    /// Check a single worker URL, e.g. one added at runtime.
    pub fn validate_worker_url(url: &str) -> ConfigResult<()> {
        Self::validate_urls(&[url.to_string()])
    }

    fn validate_mode(mode: &RoutingMode) -> ConfigResult<()> {
        match mode {
            RoutingMode::Regular { worker_urls } => {
                Self::validate_urls(worker_urls)?;
            }
            RoutingMode::PrefillDecode {
                prefill_urls,
                decode_urls,
                prefill_policy,
                decode_policy,
            } => {
                let prefill_url_strings: Vec<String> =
                    prefill_urls.iter().map(|(url, _)| url.clone()).collect();
                Self::validate_urls(&prefill_url_strings)?;
                Self::validate_urls(decode_urls)?;

                for (_url, port) in prefill_urls {
                    if let Some(0) = port {
                        return Err(ConfigError::InvalidValue {
                            field: "bootstrap_port".to_string(),
                            value: "0".to_string(),
                            reason: "Port must be between 1 and 65535".to_string(),
                        });
                    }
                }

                if let Some(p_policy) = prefill_policy {
                    Self::validate_policy(p_policy)?;
                }
                if let Some(d_policy) = decode_policy {
                    Self::validate_policy(d_policy)?;
                }
            }
        }
        Ok(())
    }

    fn validate_policy(policy: &PolicyConfig) -> ConfigResult<()> {
        match policy {
            PolicyConfig::Random
            | PolicyConfig::RoundRobin
            | PolicyConfig::PowerOfTwo
            | PolicyConfig::ConsistentHash => {}
            PolicyConfig::CacheAware {
                cache_threshold,
                balance_abs_threshold: _,
                balance_rel_threshold,
                max_tree_size,
            } => {
                if !(0.0..=1.0).contains(cache_threshold) {
                    return Err(ConfigError::InvalidValue {
                        field: "cache_threshold".to_string(),
                        value: cache_threshold.to_string(),
                        reason: "Must be between 0.0 and 1.0".to_string(),
                    });
                }

                if *balance_rel_threshold < 1.0 {
                    return Err(ConfigError::InvalidValue {
                        field: "balance_rel_threshold".to_string(),
                        value: balance_rel_threshold.to_string(),
                        reason: "Must be >= 1.0".to_string(),
                    });
                }

                if *max_tree_size == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "max_tree_size".to_string(),
                        value: max_tree_size.to_string(),
                        reason: "Must be > 0".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_server_settings(config: &RouterConfig) -> ConfigResult<()> {
        if config.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: config.port.to_string(),
                reason: "Port must be > 0".to_string(),
            });
        }

        if config.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_secs".to_string(),
                value: config.request_timeout_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if config.max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_requests".to_string(),
                value: config.max_concurrent_requests.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if config.queue_size > 0 && config.queue_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_timeout_secs".to_string(),
                value: config.queue_timeout_secs.to_string(),
                reason: "Must be > 0 when queue_size > 0".to_string(),
            });
        }

        if let Some(0) = config.rate_limit_tokens_per_second {
            return Err(ConfigError::InvalidValue {
                field: "rate_limit_tokens_per_second".to_string(),
                value: "0".to_string(),
                reason: "Must be > 0 when specified".to_string(),
            });
        }

        if config.worker_startup_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_startup_timeout_secs".to_string(),
                value: config.worker_startup_timeout_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        if config.worker_startup_check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_startup_check_interval_secs".to_string(),
                value: config.worker_startup_check_interval_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }

        Ok(())
    }

    /// PD mode needs static workers unless discovery can supply them later.
    fn validate_pd_topology(config: &RouterConfig) -> ConfigResult<()> {
        if let RoutingMode::PrefillDecode {
            prefill_urls,
            decode_urls,
            ..
        } = &config.mode
        {
            if prefill_urls.is_empty() && decode_urls.is_empty() && !config.discovery_enabled() {
                return Err(ConfigError::PdConfiguration {
                    reason: "PD disaggregation mode requires --prefill and --decode URLs \
                             when service discovery is disabled"
                        .to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_compatibility(config: &RouterConfig) -> ConfigResult<()> {
        if config.discovery_enabled() {
            return Ok(());
        }

        match &config.mode {
            RoutingMode::Regular { worker_urls } => {
                if config.policy == PolicyConfig::PowerOfTwo && worker_urls.len() < 2 {
                    return Err(ConfigError::IncompatibleConfig {
                        reason: "Power-of-two policy requires at least 2 workers".to_string(),
                    });
                }
            }
            RoutingMode::PrefillDecode {
                prefill_urls,
                decode_urls,
                ..
            } => {
                let resolution = config.pd_policy_resolution();
                if resolution.prefill == PolicyConfig::PowerOfTwo && prefill_urls.len() < 2 {
                    return Err(ConfigError::IncompatibleConfig {
                        reason: "Power-of-two policy for prefill requires at least 2 prefill workers"
                            .to_string(),
                    });
                }
                if resolution.decode == PolicyConfig::PowerOfTwo && decode_urls.len() < 2 {
                    return Err(ConfigError::IncompatibleConfig {
                        reason: "Power-of-two policy for decode requires at least 2 decode workers"
                            .to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_retry(retry: &RetryConfig) -> ConfigResult<()> {
        if retry.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff_ms".to_string(),
                value: retry.initial_backoff_ms.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff_ms".to_string(),
                value: retry.max_backoff_ms.to_string(),
                reason: "Must be >= initial_backoff_ms".to_string(),
            });
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff_multiplier".to_string(),
                value: retry.backoff_multiplier.to_string(),
                reason: "Must be >= 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                field: "retry.jitter_factor".to_string(),
                value: retry.jitter_factor.to_string(),
                reason: "Must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_circuit_breaker(cb: &CircuitBreakerConfig) -> ConfigResult<()> {
        if cb.failure_threshold < 1 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.failure_threshold".to_string(),
                value: cb.failure_threshold.to_string(),
                reason: "Must be >= 1 (use --disable-circuit-breaker to turn it off)".to_string(),
            });
        }
        if cb.success_threshold < 1 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.success_threshold".to_string(),
                value: cb.success_threshold.to_string(),
                reason: "Must be >= 1".to_string(),
            });
        }
        if cb.timeout_duration_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.timeout_duration_secs".to_string(),
                value: cb.timeout_duration_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if cb.window_duration_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.window_duration_secs".to_string(),
                value: cb.window_duration_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_health_check(health: &HealthCheckConfig) -> ConfigResult<()> {
        if health.failure_threshold < 1 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.failure_threshold".to_string(),
                value: health.failure_threshold.to_string(),
                reason: "Must be >= 1".to_string(),
            });
        }
        if health.success_threshold < 1 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.success_threshold".to_string(),
                value: health.success_threshold.to_string(),
                reason: "Must be >= 1".to_string(),
            });
        }
        if health.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.timeout_secs".to_string(),
                value: health.timeout_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if health.check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.check_interval_secs".to_string(),
                value: health.check_interval_secs.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if !health.endpoint.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "health_check.endpoint".to_string(),
                value: health.endpoint.clone(),
                reason: "Must start with '/'".to_string(),
            });
        }
        Ok(())
    }

    fn validate_urls(urls: &[String]) -> ConfigResult<()> {
        for url in urls {
            if url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "worker_url".to_string(),
                    value: url.clone(),
                    reason: "URL cannot be empty".to_string(),
                });
            }

            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    field: "worker_url".to_string(),
                    value: url.clone(),
                    reason: "URL must start with http:// or https://".to_string(),
                });
            }

            match ::url::Url::parse(url) {
                Ok(parsed) => {
                    if parsed.host_str().is_none() {
                        return Err(ConfigError::InvalidValue {
                            field: "worker_url".to_string(),
                            value: url.clone(),
                            reason: "URL must have a valid host".to_string(),
                        });
                    }
                }
                Err(e) => {
                    return Err(ConfigError::InvalidValue {
                        field: "worker_url".to_string(),
                        value: url.clone(),
                        reason: format!("Invalid URL format: {}", e),
                    });
                }
            }
        }
        Ok(())
    }
}
