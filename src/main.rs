use clap::{ArgAction, Parser};
use pd_router::{
    config::{
        CircuitBreakerConfig, ConfigValidator, DiscoveryConfig, HealthCheckConfig, PolicyConfig,
        RetryConfig, RouterConfig, RoutingMode,
    },
    server::{self, ServerConfig},
};

const POLICIES: [&str; 5] = [
    "random",
    "round_robin",
    "cache_aware",
    "power_of_two",
    "consistent_hash",
];

/// Collect `--prefill URL [BOOTSTRAP_PORT|none]` entries; the optional second
/// value does not fit clap's model.
fn parse_prefill_args(args: &[String]) -> Vec<(String, Option<u16>)> {
    let mut prefill_entries = Vec::new();
    let mut i = 0;

    while i < args.len() {
        if args[i] == "--prefill" && i + 1 < args.len() {
            let url = args[i + 1].clone();
            let bootstrap_port = match args.get(i + 2) {
                Some(next) if !next.starts_with("--") => {
                    if let Ok(port) = next.parse::<u16>() {
                        i += 1;
                        Some(port)
                    } else if next.eq_ignore_ascii_case("none") {
                        i += 1;
                        None
                    } else {
                        None
                    }
                }
                _ => None,
            };
            prefill_entries.push((url, bootstrap_port));
            i += 2;
        } else {
            i += 1;
        }
    }

    prefill_entries
}

/// `args` without the `--prefill` entries
fn strip_prefill_args(args: &[String]) -> Vec<String> {
    let mut filtered = Vec::with_capacity(args.len());
    let mut i = 0;

    while i < args.len() {
        if args[i] == "--prefill" && i + 1 < args.len() {
            i += 2;
            if let Some(next) = args.get(i) {
                if !next.starts_with("--")
                    && (next.parse::<u16>().is_ok() || next.eq_ignore_ascii_case("none"))
                {
                    i += 1;
                }
            }
        } else {
            filtered.push(args[i].clone());
            i += 1;
        }
    }

    filtered
}

#[derive(Parser, Debug)]
#[command(name = "pd-router", about = "Load-balancing router for model-serving workers")]
struct CliArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 3001)]
    port: u16,

    #[arg(long, num_args = 0..)]
    worker_urls: Vec<String>,

    #[arg(long, default_value = "cache_aware", value_parser = POLICIES)]
    policy: String,

    #[arg(long, default_value_t = false)]
    pd_disaggregation: bool,

    #[arg(long, action = ArgAction::Append)]
    decode: Vec<String>,

    #[arg(long, value_parser = POLICIES)]
    prefill_policy: Option<String>,

    #[arg(long, value_parser = POLICIES)]
    decode_policy: Option<String>,

    #[arg(long, default_value_t = 0.5)]
    cache_threshold: f32,

    #[arg(long, default_value_t = 32)]
    balance_abs_threshold: usize,

    #[arg(long, default_value_t = 1.1)]
    balance_rel_threshold: f32,

    #[arg(long, default_value_t = 10000)]
    max_tree_size: usize,

    #[arg(long, default_value_t = 3)]
    retry_max_retries: u32,

    #[arg(long, default_value_t = 100)]
    retry_initial_backoff_ms: u64,

    #[arg(long, default_value_t = 10000)]
    retry_max_backoff_ms: u64,

    #[arg(long, default_value_t = 2.0)]
    retry_backoff_multiplier: f32,

    #[arg(long, default_value_t = 0.1)]
    retry_jitter_factor: f32,

    #[arg(long, default_value_t = false)]
    disable_retries: bool,

    #[arg(long, default_value_t = 5)]
    cb_failure_threshold: u32,

    #[arg(long, default_value_t = 2)]
    cb_success_threshold: u32,

    #[arg(long, default_value_t = 30)]
    cb_timeout_duration_secs: u64,

    #[arg(long, default_value_t = 60)]
    cb_window_duration_secs: u64,

    #[arg(long, default_value_t = false)]
    disable_circuit_breaker: bool,

    #[arg(long, default_value_t = 3)]
    health_failure_threshold: u32,

    #[arg(long, default_value_t = 2)]
    health_success_threshold: u32,

    #[arg(long, default_value_t = 5)]
    health_check_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    health_check_interval_secs: u64,

    #[arg(long, default_value = "/health")]
    health_check_endpoint: String,

    #[arg(long, default_value_t = 256)]
    max_concurrent_requests: usize,

    #[arg(long, default_value_t = 100)]
    queue_size: usize,

    #[arg(long, default_value_t = 60)]
    queue_timeout_secs: u64,

    #[arg(long)]
    rate_limit_tokens_per_second: Option<usize>,

    #[arg(long, default_value_t = 1800)]
    request_timeout_secs: u64,

    #[arg(long, default_value_t = 600)]
    worker_startup_timeout_secs: u64,

    #[arg(long = "worker-startup-check-interval", default_value_t = 10)]
    worker_startup_check_interval_secs: u64,

    #[arg(long, default_value_t = 268435456)]
    max_payload_size: usize,

    #[arg(long, default_value_t = false)]
    service_discovery: bool,

    #[arg(long)]
    log_dir: Option<String>,

    #[arg(long, value_parser = ["debug", "info", "warn", "error"])]
    log_level: Option<String>,

    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl CliArgs {
    fn parse_policy(&self, policy_str: &str) -> PolicyConfig {
        match policy_str {
            "random" => PolicyConfig::Random,
            "round_robin" => PolicyConfig::RoundRobin,
            "power_of_two" => PolicyConfig::PowerOfTwo,
            "consistent_hash" => PolicyConfig::ConsistentHash,
            _ => PolicyConfig::CacheAware {
                cache_threshold: self.cache_threshold,
                balance_abs_threshold: self.balance_abs_threshold,
                balance_rel_threshold: self.balance_rel_threshold,
                max_tree_size: self.max_tree_size,
            },
        }
    }

    fn to_router_config(&self, prefill_urls: Vec<(String, Option<u16>)>) -> RouterConfig {
        let mode = if self.pd_disaggregation {
            RoutingMode::PrefillDecode {
                prefill_urls,
                decode_urls: self.decode.clone(),
                prefill_policy: self.prefill_policy.as_deref().map(|p| self.parse_policy(p)),
                decode_policy: self.decode_policy.as_deref().map(|p| self.parse_policy(p)),
            }
        } else {
            RoutingMode::Regular {
                worker_urls: self.worker_urls.clone(),
            }
        };

        RouterConfig {
            mode,
            policy: self.parse_policy(&self.policy),
            host: self.host.clone(),
            port: self.port,
            request_timeout_secs: self.request_timeout_secs,
            worker_startup_timeout_secs: self.worker_startup_timeout_secs,
            worker_startup_check_interval_secs: self.worker_startup_check_interval_secs,
            discovery: self
                .service_discovery
                .then_some(DiscoveryConfig { enabled: true }),
            log_dir: self.log_dir.clone(),
            log_level: self.log_level.clone(),
            log_json: self.log_json,
            max_concurrent_requests: self.max_concurrent_requests,
            queue_size: self.queue_size,
            queue_timeout_secs: self.queue_timeout_secs,
            rate_limit_tokens_per_second: self.rate_limit_tokens_per_second,
            retry: RetryConfig {
                max_retries: self.retry_max_retries,
                initial_backoff_ms: self.retry_initial_backoff_ms,
                max_backoff_ms: self.retry_max_backoff_ms,
                backoff_multiplier: self.retry_backoff_multiplier,
                jitter_factor: self.retry_jitter_factor,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.cb_failure_threshold,
                success_threshold: self.cb_success_threshold,
                timeout_duration_secs: self.cb_timeout_duration_secs,
                window_duration_secs: self.cb_window_duration_secs,
            },
            disable_retries: self.disable_retries,
            disable_circuit_breaker: self.disable_circuit_breaker,
            health_check: HealthCheckConfig {
                failure_threshold: self.health_failure_threshold,
                success_threshold: self.health_success_threshold,
                timeout_secs: self.health_check_timeout_secs,
                check_interval_secs: self.health_check_interval_secs,
                endpoint: self.health_check_endpoint.clone(),
            },
        }
    }
}

fn main() -> anyhow::Result<()> {
    let raw_args: Vec<String> = std::env::args().collect();
    let prefill_urls = parse_prefill_args(&raw_args);
    let cli_args = CliArgs::parse_from(strip_prefill_args(&raw_args));

    println!("PD router starting...");
    println!("Host: {}:{}", cli_args.host, cli_args.port);
    println!(
        "Mode: {}",
        if cli_args.pd_disaggregation {
            "PD Disaggregated"
        } else {
            "Regular"
        }
    );
    println!("Policy: {}", cli_args.policy);
    if cli_args.pd_disaggregation {
        println!("Prefill nodes: {:?}", prefill_urls);
        println!("Decode nodes: {:?}", cli_args.decode);
    }

    let router_config = cli_args.to_router_config(prefill_urls);
    ConfigValidator::validate(&router_config)?;

    let server_config = ServerConfig {
        router_config,
        max_payload_size: cli_args.max_payload_size,
    };
    let runtime = tokio::runtime::Runtime::new()?;
    runtime
        .block_on(server::startup(server_config))
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}
