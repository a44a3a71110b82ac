use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ConfigValidator, RouterConfig},
    core::{
        AdmissionController, AdmissionPermit, HealthChecker, PoolRole, RouterError, RouterResult,
        WorkerId, WorkerRegistry,
    },
    logging::{self, LoggingConfig},
    routers::{
        register_static_workers, wait_for_healthy_workers, worker_from_config, RouteRequest,
        RouterKind,
    },
};

#[derive(Debug)]
pub struct AppState {
    pub router: RouterKind,
    pub registry: Arc<WorkerRegistry>,
    pub admission: AdmissionController,
    pub client: reqwest::Client,
    pub config: RouterConfig,
}

impl AppState {
    /// Validate `config`, register its static workers and build the router.
    ///
    /// An invalid configuration (including a PD topology with no way to get
    /// workers) is rejected here, before anything can be served.
    pub fn new(config: RouterConfig, client: reqwest::Client) -> RouterResult<Self> {
        ConfigValidator::validate(&config)?;

        let registry = Arc::new(WorkerRegistry::new());
        register_static_workers(&config, &registry);
        let router = RouterKind::from_config(&config, Arc::clone(&registry), client.clone());
        let admission = AdmissionController::new(config.admission_config());

        Ok(Self {
            router,
            registry,
            admission,
            client,
            config,
        })
    }

    /// Admission, worker selection and dispatch under the request timeout.
    pub async fn route_inference(
        &self,
        route: &'static str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Response {
        let req = match RouteRequest::parse(route, headers, body) {
            Ok(req) => req,
            Err(e) => return e.into_response(),
        };

        let timeout = self.config.request_timeout();
        let result = tokio::time::timeout(timeout, async {
            let permit = self.admission.acquire().await?;
            let response = self.router.route(&req).await?;
            Ok::<_, RouterError>((permit, response))
        })
        .await;

        match result {
            Ok(Ok((permit, response))) => {
                if req.is_stream() && response.status().is_success() {
                    hold_permit_until_end(response, permit)
                } else {
                    response
                }
            }
            Ok(Err(e)) => {
                debug!(route, error = %e, "Request failed");
                e.into_response()
            }
            Err(_) => {
                warn!(route, timeout_secs = timeout.as_secs(), "Request timed out");
                RouterError::RequestTimeout(timeout).into_response()
            }
        }
    }
}

/// Keep the admission slot taken until a streamed body is fully sent.
fn hold_permit_until_end(response: Response, permit: AdmissionPermit) -> Response {
    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &permit;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}

async fn sink_handler() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn liveness() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    state.router.readiness()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "mode": state.router.mode(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "workers": state.registry.stats(),
        "in_flight": state.admission.in_flight(),
        "queued": state.admission.queued(),
    }))
    .into_response()
}

async fn v1_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match state.router.get_models(&state.client, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn generate(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    state.route_inference("/generate", &headers, &body).await
}

async fn v1_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.route_inference("/v1/completions", &headers, &body).await
}

async fn v1_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state
        .route_inference("/v1/chat/completions", &headers, &body)
        .await
}

#[derive(Debug, Deserialize)]
struct AddWorkerRequest {
    url: String,
    role: Option<PoolRole>,
    bootstrap_port: Option<u16>,
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Response {
    let workers: Vec<_> = state
        .registry
        .all()
        .iter()
        .map(|w| {
            json!({
                "id": w.id(),
                "url": w.url(),
                "role": w.role(),
                "health": w.health(),
                "load": w.load(),
                "circuit_state": w.circuit_breaker().state(),
                "latency_ms": w.latency_estimate().map(|d| d.as_secs_f64() * 1000.0),
                "bootstrap_port": w.bootstrap_port(),
            })
        })
        .collect();

    Json(json!({
        "workers": workers,
        "stats": state.registry.stats(),
    }))
    .into_response()
}

async fn create_worker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddWorkerRequest>,
) -> Response {
    match add_worker(&state, req) {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Err(e) => e.into_response(),
    }
}

fn add_worker(state: &AppState, req: AddWorkerRequest) -> RouterResult<WorkerId> {
    ConfigValidator::validate_worker_url(&req.url)?;

    let role = match (state.router.serving_role(), req.role) {
        (PoolRole::Unified, None | Some(PoolRole::Unified)) => PoolRole::Unified,
        (PoolRole::Decode, Some(role @ (PoolRole::Prefill | PoolRole::Decode))) => role,
        (_, role) => {
            return Err(RouterError::InvalidRequest(format!(
                "Role {} is not valid in {} mode",
                role.map_or("(none)", |r| r.as_str()),
                state.router.mode()
            )))
        }
    };
    if req.bootstrap_port.is_some() && role != PoolRole::Prefill {
        return Err(RouterError::InvalidRequest(
            "bootstrap_port is only valid for prefill workers".to_string(),
        ));
    }

    let worker = worker_from_config(&req.url, role, req.bootstrap_port, &state.config);
    Ok(state.registry.add(worker))
}

async fn delete_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Response {
    let id = WorkerId::from_string(worker_id);
    match state.registry.remove(&id) {
        Some(worker) => Json(json!({ "id": id, "url": worker.url() })).into_response(),
        None => RouterError::WorkerNotFound(id.as_str().to_string()).into_response(),
    }
}

pub struct ServerConfig {
    pub router_config: RouterConfig,
    pub max_payload_size: usize,
}

impl ServerConfig {
    pub fn new(router_config: RouterConfig) -> Self {
        Self {
            router_config,
            max_payload_size: 256 * 1024 * 1024,
        }
    }
}

pub fn build_app(app_state: Arc<AppState>, max_payload_size: usize) -> Router {
    let inference_routes = Router::new()
        .route("/generate", post(generate))
        .route("/v1/completions", post(v1_completions))
        .route("/v1/chat/completions", post(v1_chat_completions));

    let public_routes = Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/health", get(health))
        .route("/v1/models", get(v1_models));

    let worker_routes = Router::new()
        .route("/workers", post(create_worker).get(list_workers))
        .route("/workers/{worker_id}", delete(delete_worker));

    Router::new()
        .merge(inference_routes)
        .merge(public_routes)
        .merge(worker_routes)
        .layer(DefaultBodyLimit::max(max_payload_size))
        .fallback(sink_handler)
        .with_state(app_state)
}

/// Upstream HTTP client.
///
/// Time to response headers is bounded per request in `route_inference`, so
/// the client only limits connecting and each idle read. A streamed body may
/// run past `request_timeout_secs` as long as chunks keep arriving.
pub fn build_client(config: &RouterConfig) -> reqwest::Result<reqwest::Client> {
    let request_timeout = config.request_timeout();
    reqwest::Client::builder()
        .pool_idle_timeout(Some(Duration::from_secs(50)))
        .pool_max_idle_per_host(500)
        .connect_timeout(request_timeout.min(Duration::from_secs(10)))
        .read_timeout(request_timeout)
        .build()
}

pub async fn startup(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

    let router_config = config.router_config;
    let _log_guard = if !LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        Some(logging::init_logging(LoggingConfig::from_router_config(
            &router_config,
        )))
    } else {
        None
    };

    info!(
        "Starting router on {}:{} | mode: {} | policy: {} | workers: {} | max_payload: {}MB",
        router_config.host,
        router_config.port,
        if router_config.is_pd_mode() {
            "prefill_decode"
        } else {
            "regular"
        },
        router_config.policy.name(),
        router_config.mode.worker_count(),
        config.max_payload_size / (1024 * 1024)
    );

    let client = build_client(&router_config)?;

    let state = AppState::new(router_config, client).inspect_err(|e| {
        error!("Invalid configuration: {}", e);
    })?;

    let health_checker = HealthChecker::start(
        Arc::clone(&state.registry),
        state.client.clone(),
        Duration::from_secs(state.config.health_check.check_interval_secs),
    );

    if !state.registry.is_empty() && !state.config.discovery_enabled() {
        wait_for_healthy_workers(
            &state.registry,
            &state.client,
            Duration::from_secs(state.config.worker_startup_timeout_secs),
            Duration::from_secs(state.config.worker_startup_check_interval_secs),
        )
        .await?;
    }

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = build_app(Arc::new(state), config.max_payload_size);

    let listener = TcpListener::bind(&addr).await?;
    info!("Router listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health_checker.shutdown().await;
    info!("Router stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, PolicyConfig, RoutingMode};
    use axum::{body::to_bytes, http::Request};
    use tower::ServiceExt;

    fn regular_state(urls: &[&str]) -> Arc<AppState> {
        let config = RouterConfig::new(
            RoutingMode::Regular {
                worker_urls: urls.iter().map(|u| u.to_string()).collect(),
            },
            PolicyConfig::RoundRobin,
        );
        Arc::new(AppState::new(config, reqwest::Client::new()).unwrap())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_pd_without_workers_rejected_unless_discovery() {
        let mode = RoutingMode::PrefillDecode {
            prefill_urls: vec![],
            decode_urls: vec![],
            prefill_policy: None,
            decode_policy: None,
        };
        let config = RouterConfig::new(mode.clone(), PolicyConfig::Random);
        let err = AppState::new(config, reqwest::Client::new()).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("PD disaggregation mode requires --prefill and --decode URLs"));

        let config = RouterConfig {
            discovery: Some(DiscoveryConfig { enabled: true }),
            ..RouterConfig::new(mode, PolicyConfig::Random)
        };
        let state = AppState::new(config, reqwest::Client::new()).unwrap();
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_liveness_and_fallback() {
        let app = build_app(regular_state(&[]), 1024);

        let res = app
            .clone()
            .oneshot(Request::get("/liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_readiness_without_workers() {
        let app = build_app(regular_state(&[]), 1024);
        let res = app
            .oneshot(Request::get("/readiness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let app = build_app(regular_state(&["http://127.0.0.1:1"]), 1024);
        let res = app
            .oneshot(
                Request::post("/generate")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_worker_admin_lifecycle() {
        let state = regular_state(&[]);
        let app = build_app(Arc::clone(&state), 1024);

        let res = app
            .clone()
            .oneshot(
                Request::post("/workers")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"url": "http://10.0.0.1:8000"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let id = body_json(res).await["id"].as_str().unwrap().to_string();
        assert_eq!(state.registry.len(), 1);

        let res = app
            .clone()
            .oneshot(Request::get("/workers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listing = body_json(res).await;
        assert_eq!(listing["workers"][0]["url"], "http://10.0.0.1:8000");
        assert_eq!(listing["workers"][0]["health"], "unknown");
        assert_eq!(listing["workers"][0]["circuit_state"], "closed");

        let res = app
            .clone()
            .oneshot(
                Request::delete(format!("/workers/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(state.registry.is_empty());

        let res = app
            .oneshot(
                Request::delete(format!("/workers/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_worker_rejects_wrong_role() {
        let state = regular_state(&[]);
        let err = add_worker(
            &state,
            AddWorkerRequest {
                url: "http://10.0.0.1:8000".to_string(),
                role: Some(PoolRole::Prefill),
                bootstrap_port: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest(_)));

        let err = add_worker(
            &state,
            AddWorkerRequest {
                url: "ftp://10.0.0.1".to_string(),
                role: None,
                bootstrap_port: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, RouterError::Config(_)));
    }
}
