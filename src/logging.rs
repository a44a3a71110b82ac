use std::{path::PathBuf, str::FromStr};

use tracing::Level;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::RouterConfig;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json_format: bool,
    /// Daily-rolled log files go here when set; stdout always gets logs
    pub log_dir: Option<String>,
    pub colorize: bool,
    pub log_file_name: String,
    /// Targets the level applies to
    pub log_targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            log_dir: None,
            colorize: true,
            log_file_name: "pd-router".to_string(),
            log_targets: vec!["pd_router".to_string()],
        }
    }
}

impl LoggingConfig {
    /// Logging settings of a router config. Unknown level names fall back to info.
    pub fn from_router_config(config: &RouterConfig) -> Self {
        let level = config
            .log_level
            .as_deref()
            .and_then(|l| Level::from_str(l).ok())
            .unwrap_or(Level::INFO);
        Self {
            level,
            json_format: config.log_json,
            log_dir: config.log_dir.clone(),
            ..Default::default()
        }
    }

    /// `target=level` directives, used when `RUST_LOG` is not set
    pub fn filter_directives(&self) -> String {
        let level = self.level.as_str().to_lowercase();
        self.log_targets
            .iter()
            .map(|target| format!("{}={}", target, level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Keeps the file appender's writer thread alive; hold it for the life of the process.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Calling it again is harmless: the first
/// subscriber stays in place.
pub fn init_logging(config: LoggingConfig) -> LogGuard {
    // Route `log` records from dependencies through tracing
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let mut layers = Vec::new();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.colorize)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()));
    layers.push(if config.json_format {
        stdout_layer.json().flatten_event(true).boxed()
    } else {
        stdout_layer.boxed()
    });

    let mut file_guard = None;
    if let Some(log_dir) = &config.log_dir {
        let log_dir = PathBuf::from(log_dir);
        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let appender = RollingFileAppender::new(
                    Rotation::DAILY,
                    log_dir,
                    config.log_file_name.clone(),
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);

                let file_layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
                    .with_writer(writer);
                layers.push(if config.json_format {
                    file_layer.json().flatten_event(true).boxed()
                } else {
                    file_layer.boxed()
                });
            }
            Err(e) => eprintln!("Failed to create log directory {:?}: {}", log_dir, e),
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}
