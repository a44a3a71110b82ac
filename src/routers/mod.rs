//! Request routers
//!
//! [`RouterKind`] picks between the regular router (one unified pool) and the
//! prefill/decode router. Both share request parsing, upstream dispatch and
//! header handling from the submodules here.

pub mod header_utils;
pub mod pd_coordinator;
pub mod pd_request;
pub mod pd_router;
pub mod request;
pub mod router;
pub mod upstream;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

pub use pd_coordinator::PdCoordinator;
pub use pd_router::PdRouter;
pub use request::RouteRequest;
pub use router::Router;

use crate::{
    config::{RouterConfig, RoutingMode},
    core::{
        circuit_breaker::CircuitBreakerConfig, health::check_all, PoolRole, RouterError,
        RouterResult, Worker, WorkerId, WorkerRegistry,
    },
};
use header_utils::{forward_request_headers, preserve_response_headers};

#[derive(Debug)]
pub enum RouterKind {
    Regular(Router),
    PrefillDecode(PdRouter),
}

impl RouterKind {
    pub fn from_config(
        config: &RouterConfig,
        registry: Arc<WorkerRegistry>,
        client: reqwest::Client,
    ) -> Self {
        let retry = config.effective_retry_config();
        match &config.mode {
            RoutingMode::Regular { .. } => {
                RouterKind::Regular(Router::new(registry, client, &config.policy, retry))
            }
            RoutingMode::PrefillDecode { .. } => RouterKind::PrefillDecode(PdRouter::new(
                registry,
                client,
                config.pd_policy_resolution(),
                retry,
            )),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            RouterKind::Regular(_) => "regular",
            RouterKind::PrefillDecode(_) => "prefill_decode",
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        match self {
            RouterKind::Regular(r) => r.registry(),
            RouterKind::PrefillDecode(r) => r.registry(),
        }
    }

    /// Pools that must have an eligible worker for requests to succeed
    pub fn required_roles(&self) -> &'static [PoolRole] {
        match self {
            RouterKind::Regular(_) => &[PoolRole::Unified],
            RouterKind::PrefillDecode(_) => &[PoolRole::Prefill, PoolRole::Decode],
        }
    }

    /// Pool that produces client-visible responses
    pub fn serving_role(&self) -> PoolRole {
        match self {
            RouterKind::Regular(_) => PoolRole::Unified,
            RouterKind::PrefillDecode(_) => PoolRole::Decode,
        }
    }

    pub async fn route(&self, req: &RouteRequest) -> RouterResult<Response> {
        match self {
            RouterKind::Regular(r) => r.route(req).await,
            RouterKind::PrefillDecode(r) => r.route(req).await,
        }
    }

    pub fn readiness(&self) -> Response {
        let registry = self.registry();
        let missing: Vec<&'static str> = self
            .required_roles()
            .iter()
            .filter(|role| registry.snapshot(**role).is_err())
            .map(|role| role.as_str())
            .collect();
        let stats = registry.stats();

        if missing.is_empty() {
            Json(json!({
                "status": "ready",
                "mode": self.mode(),
                "healthy_workers": stats.healthy_workers,
                "total_workers": stats.total_workers,
            }))
            .into_response()
        } else {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "mode": self.mode(),
                    "reason": format!("no eligible workers in pool(s): {}", missing.join(", ")),
                    "total_workers": stats.total_workers,
                })),
            )
                .into_response()
        }
    }

    /// Proxy `/v1/models` to the first eligible worker of the serving pool.
    pub async fn get_models(
        &self,
        client: &reqwest::Client,
        headers: &HeaderMap,
    ) -> RouterResult<Response> {
        let snapshot = self.registry().snapshot(self.serving_role())?;
        let worker = snapshot
            .workers()
            .first()
            .ok_or(RouterError::NoHealthyWorker {
                role: self.serving_role(),
            })?;
        let url = format!("{}/v1/models", worker.url().trim_end_matches('/'));

        let res = client
            .get(&url)
            .headers(forward_request_headers(headers))
            .send()
            .await
            .map_err(|e| RouterError::WorkerUnreachable {
                worker_url: worker.url().to_string(),
                message: e.to_string(),
            })?;
        let status = res.status();
        let response_headers = preserve_response_headers(res.headers());
        let body = res.bytes().await.map_err(|e| RouterError::WorkerUnreachable {
            worker_url: worker.url().to_string(),
            message: format!("Failed to read response: {}", e),
        })?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Worker with the health, breaker and prefix-cache settings of `config`.
pub fn worker_from_config(
    url: &str,
    role: PoolRole,
    bootstrap_port: Option<u16>,
    config: &RouterConfig,
) -> Worker {
    let policy = match role {
        PoolRole::Unified => &config.policy,
        PoolRole::Prefill => config.mode.get_prefill_policy(&config.policy),
        PoolRole::Decode => config.mode.get_decode_policy(&config.policy),
    };
    let mut builder = Worker::builder(url)
        .role(role)
        .bootstrap_port(bootstrap_port)
        .health_config(config.health_check.clone())
        .circuit_breaker_config(CircuitBreakerConfig::from(
            &config.effective_circuit_breaker_config(),
        ));
    if let Some(max) = policy.max_tree_size() {
        builder = builder.max_cache_entries(max);
    }
    builder.build()
}

/// Register the workers listed in the routing mode.
pub fn register_static_workers(config: &RouterConfig, registry: &WorkerRegistry) -> Vec<WorkerId> {
    let mut ids = Vec::with_capacity(config.mode.worker_count());
    match &config.mode {
        RoutingMode::Regular { worker_urls } => {
            for url in worker_urls {
                ids.push(registry.add(worker_from_config(url, PoolRole::Unified, None, config)));
            }
        }
        RoutingMode::PrefillDecode {
            prefill_urls,
            decode_urls,
            ..
        } => {
            for (url, port) in prefill_urls {
                ids.push(registry.add(worker_from_config(url, PoolRole::Prefill, *port, config)));
            }
            for url in decode_urls {
                ids.push(registry.add(worker_from_config(url, PoolRole::Decode, None, config)));
            }
        }
    }
    ids
}

/// Probe registered workers until all are healthy or `timeout` elapses.
///
/// Running out of time with some workers still down is only a warning; it is
/// an error when a pool that has workers ends up with none healthy.
pub async fn wait_for_healthy_workers(
    registry: &WorkerRegistry,
    client: &reqwest::Client,
    timeout: Duration,
    interval: Duration,
) -> RouterResult<()> {
    let workers = registry.all();
    if workers.is_empty() {
        return Ok(());
    }

    info!(
        "Waiting for {} workers to become healthy (timeout: {}s)",
        workers.len(),
        timeout.as_secs()
    );
    let deadline = Instant::now() + timeout;

    loop {
        check_all(registry, client).await;

        let unhealthy: Vec<&str> = workers
            .iter()
            .filter(|w| !w.is_healthy())
            .map(|w| w.url())
            .collect();
        if unhealthy.is_empty() {
            info!("All {} workers are healthy", workers.len());
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            for role in [PoolRole::Unified, PoolRole::Prefill, PoolRole::Decode] {
                let pool = registry.workers_for(role);
                if !pool.is_empty() && !pool.iter().any(|w| w.is_healthy()) {
                    error!(
                        "Timeout {}s waiting for {} workers {:?} to become healthy",
                        timeout.as_secs(),
                        role,
                        unhealthy
                    );
                    return Err(RouterError::NoHealthyWorker { role });
                }
            }
            warn!(
                "Startup timeout reached with {} of {} workers unhealthy: {:?}",
                unhealthy.len(),
                workers.len(),
                unhealthy
            );
            return Ok(());
        }

        debug!(
            "Waiting for {} workers to become healthy ({} unhealthy: {:?})",
            workers.len(),
            unhealthy.len(),
            unhealthy
        );
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
