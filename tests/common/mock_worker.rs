use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerType {
    Regular,
    Prefill,
    Decode,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FailureMode {
    None,
    /// Every generation request gets this status
    Status(u16),
}

/// Configuration for mock worker behavior
#[derive(Clone, Debug)]
pub struct MockWorkerConfig {
    pub worker_type: WorkerType,
    pub health_status: HealthStatus,
    pub response_delay_ms: u64,
    /// Pause before each streamed event
    pub stream_interval_ms: u64,
    pub failure: FailureMode,
}

impl Default for MockWorkerConfig {
    fn default() -> Self {
        Self {
            worker_type: WorkerType::Regular,
            health_status: HealthStatus::Healthy,
            response_delay_ms: 0,
            stream_interval_ms: 0,
            failure: FailureMode::None,
        }
    }
}

struct MockState {
    name: String,
    config: RwLock<MockWorkerConfig>,
    requests: Mutex<Vec<Value>>,
    health_checks: AtomicUsize,
}

/// In-process HTTP worker that records what it receives
pub struct MockWorker {
    state: Arc<MockState>,
    url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    shutdown_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockWorker {
    pub async fn start(config: MockWorkerConfig) -> Self {
        let state = Arc::new(MockState {
            name: format!("mock-{}", &Uuid::new_v4().to_string()[..8]),
            config: RwLock::new(config),
            requests: Mutex::new(Vec::new()),
            health_checks: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/models", get(models_handler))
            .route("/generate", post(generate_handler))
            .route("/v1/completions", post(generate_handler))
            .route("/v1/chat/completions", post(generate_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock worker");
        let url = format!("http://{}", listener.local_addr().unwrap());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                eprintln!("Mock worker error: {}", e);
            }
        });

        Self {
            state,
            url,
            shutdown_tx: Some(shutdown_tx),
            shutdown_handle: Some(handle),
        }
    }

    pub async fn healthy() -> Self {
        Self::start(MockWorkerConfig::default()).await
    }

    pub async fn with_type(worker_type: WorkerType) -> Self {
        Self::start(MockWorkerConfig {
            worker_type,
            ..Default::default()
        })
        .await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Generation requests received so far
    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().clone()
    }

    pub fn health_checks(&self) -> usize {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    pub async fn set_health(&self, status: HealthStatus) {
        self.state.config.write().await.health_status = status;
    }

    pub async fn set_failure(&self, failure: FailureMode) {
        self.state.config.write().await.failure = failure;
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.shutdown_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn health_handler(State(state): State<Arc<MockState>>) -> Response {
    state.health_checks.fetch_add(1, Ordering::SeqCst);
    match state.config.read().await.health_status {
        HealthStatus::Healthy => Json(json!({"status": "healthy"})).into_response(),
        HealthStatus::Unhealthy => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy"})),
        )
            .into_response(),
    }
}

async fn models_handler(State(state): State<Arc<MockState>>) -> Response {
    Json(json!({
        "object": "list",
        "data": [{"id": "mock-model", "object": "model", "owned_by": state.name}]
    }))
    .into_response()
}

async fn generate_handler(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.requests.lock().push(body.clone());
    let config = state.config.read().await.clone();

    if config.response_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.response_delay_ms)).await;
    }

    if let FailureMode::Status(code) = config.failure {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (
            status,
            Json(json!({"error": format!("{} configured to fail", state.name)})),
        )
            .into_response();
    }

    if config.worker_type == WorkerType::Prefill {
        return Json(json!({
            "worker": state.name,
            "text": "",
            "kv_transfer_params": {
                "remote_engine_id": state.name,
                "remote_block_ids": [1, 2, 3],
            },
        }))
        .into_response();
    }

    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        let name = state.name.clone();
        let events = (0..3)
            .map(move |i| {
                Ok::<_, Infallible>(
                    Event::default().data(json!({"worker": name, "index": i, "text": "tok"}).to_string()),
                )
            })
            .chain(std::iter::once(Ok(Event::default().data("[DONE]"))));
        let interval = Duration::from_millis(config.stream_interval_ms);
        let paced = stream::iter(events).then(move |event| async move {
            tokio::time::sleep(interval).await;
            event
        });
        return Sse::new(paced).into_response();
    }

    Json(json!({
        "worker": state.name,
        "text": "mock response",
        "received": body,
    }))
    .into_response()
}
