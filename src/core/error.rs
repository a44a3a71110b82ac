//! Error taxonomy for routing and resilience decisions

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{
    retry::{is_retryable_status, RetryError},
    worker::PoolRole,
};
use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No eligible worker for the requested role
    #[error("No healthy {role} worker available")]
    NoHealthyWorker { role: PoolRole },

    /// Every candidate's circuit is open; nothing was dispatched
    #[error("Circuit breaker open for worker {worker_url}")]
    CircuitOpen { worker_url: String },

    #[error("All {attempts} attempts failed, last error: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<RouterError>,
    },

    #[error("Request queue is full")]
    QueueFull,

    #[error("Timed out after {0:?} waiting in the request queue")]
    QueueTimeout(Duration),

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Transport-level failure within one attempt
    #[error("Worker {worker_url} unreachable: {message}")]
    WorkerUnreachable { worker_url: String, message: String },

    /// Worker answered with a failure status
    #[error("Worker {worker_url} returned {status}")]
    UpstreamStatus {
        worker_url: String,
        status: StatusCode,
        body: String,
    },

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type RouterResult<T> = Result<T, RouterError>;

impl RouterError {
    /// Whether another attempt (possibly on another worker) may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::WorkerUnreachable { .. } => true,
            RouterError::UpstreamStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::NoHealthyWorker { .. } | RouterError::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RouterError::RetryExhausted { last, .. } => match last.as_ref() {
                RouterError::UpstreamStatus { status, .. } => *status,
                other => match other.status_code() {
                    StatusCode::SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_GATEWAY,
                },
            },
            RouterError::QueueFull | RouterError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RouterError::QueueTimeout(_) | RouterError::RequestTimeout(_) => {
                StatusCode::REQUEST_TIMEOUT
            }
            RouterError::WorkerUnreachable { .. } => StatusCode::BAD_GATEWAY,
            RouterError::UpstreamStatus { status, .. } => *status,
            RouterError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            RouterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RouterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::NoHealthyWorker { .. } => "no_healthy_worker",
            RouterError::CircuitOpen { .. } => "circuit_open",
            RouterError::RetryExhausted { .. } => "retry_exhausted",
            RouterError::QueueFull => "queue_full",
            RouterError::QueueTimeout(_) => "queue_timeout",
            RouterError::RateLimited => "rate_limited",
            RouterError::WorkerUnreachable { .. } => "worker_unreachable",
            RouterError::UpstreamStatus { .. } => "upstream_error",
            RouterError::WorkerNotFound(_) => "worker_not_found",
            RouterError::RequestTimeout(_) => "request_timeout",
            RouterError::InvalidRequest(_) => "invalid_request",
            RouterError::Config(ConfigError::PdConfiguration { .. }) => "pd_configuration_error",
            RouterError::Config(_) => "configuration_error",
        }
    }
}

impl From<RetryError<RouterError>> for RouterError {
    fn from(err: RetryError<RouterError>) -> Self {
        match err {
            RetryError::Failed(err) => err,
            RetryError::Exhausted { attempts, last } => RouterError::RetryExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}
