//! Prefill/decode disaggregated router
//!
//! Each attempt claims a pair, runs the prefill stage to completion, then
//! sends the decode stage and forwards its response. A failure in either
//! stage fails the attempt, and the retry re-selects both workers.

use std::sync::Arc;

use axum::response::Response;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    header_utils::{set_worker_id, PREFILL_WORKER_ID_HEADER},
    pd_coordinator::PdCoordinator,
    pd_request::{prepare_decode_request, prepare_prefill_request, BootstrapInfo},
    request::RouteRequest,
    upstream::{forward_response, send_json},
};
use crate::{
    config::{PdPolicyResolution, RetryConfig},
    core::{
        DispatchGuard, DispatchOutcome, RetryExecutor, RouterError, RouterResult, WorkerId,
        WorkerRegistry,
    },
};

#[derive(Debug, Default)]
struct FailedWorkers {
    prefill: Vec<WorkerId>,
    decode: Vec<WorkerId>,
}

#[derive(Debug)]
pub struct PdRouter {
    coordinator: PdCoordinator,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl PdRouter {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        client: reqwest::Client,
        resolution: PdPolicyResolution,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            coordinator: PdCoordinator::new(registry, resolution),
            client,
            retry_config,
        }
    }

    pub fn coordinator(&self) -> &PdCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.coordinator.registry()
    }

    pub async fn route(&self, req: &RouteRequest) -> RouterResult<Response> {
        let failed = Mutex::new(FailedWorkers::default());
        let info = req.select_info();

        let result = RetryExecutor::execute_with_retry(
            &self.retry_config,
            |attempt| {
                let failed = &failed;
                async move {
                    let (avoid_prefill, avoid_decode) = {
                        let failed = failed.lock();
                        (failed.prefill.clone(), failed.decode.clone())
                    };
                    let (prefill, decode) =
                        self.coordinator
                            .acquire_pair(&info, &avoid_prefill, &avoid_decode)?;
                    debug!(
                        attempt,
                        prefill = %prefill.worker().url(),
                        decode = %decode.worker().url(),
                        route = req.route(),
                        "Dispatching PD pair"
                    );
                    self.dispatch_pair(req, prefill, decode, failed).await
                }
            },
            |err, _attempt| err.is_retryable(),
            |err, delay, next_attempt| {
                warn!(
                    route = req.route(),
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying PD request after error: {}",
                    err
                );
            },
        )
        .await;

        result.map_err(Into::into)
    }

    async fn dispatch_pair(
        &self,
        req: &RouteRequest,
        prefill: DispatchGuard,
        decode: DispatchGuard,
        failed: &Mutex<FailedWorkers>,
    ) -> RouterResult<Response> {
        let prefill_worker = Arc::clone(prefill.worker());
        let decode_worker = Arc::clone(decode.worker());

        let bootstrap = BootstrapInfo::for_prefill(req.body(), &prefill_worker)?;
        let prefill_body = prepare_prefill_request(req.body(), &bootstrap)?;

        let res = match send_json(
            &self.client,
            &prefill_worker,
            req.route(),
            req.headers(),
            &prefill_body,
        )
        .await
        {
            Ok(res) => res,
            Err(e) => {
                prefill.finish(DispatchOutcome::Failure);
                failed.lock().prefill.push(prefill_worker.id().clone());
                return Err(e);
            }
        };

        // A non-retryable prefill rejection (e.g. a 4xx) is the answer; the
        // decode claim is released unused.
        if !res.status().is_success() {
            drop(decode);
            return forward_response(res, prefill, false).await;
        }

        let prefill_response: Option<Value> = match res.bytes().await {
            Ok(bytes) => {
                prefill.finish(DispatchOutcome::Success);
                serde_json::from_slice(&bytes).ok()
            }
            Err(e) => {
                prefill.finish(DispatchOutcome::Failure);
                failed.lock().prefill.push(prefill_worker.id().clone());
                return Err(RouterError::WorkerUnreachable {
                    worker_url: prefill_worker.url().to_string(),
                    message: format!("Failed to read prefill response: {}", e),
                });
            }
        };

        let decode_body =
            prepare_decode_request(req.body(), prefill_response.as_ref(), &bootstrap)?;
        let res = match send_json(
            &self.client,
            &decode_worker,
            req.route(),
            req.headers(),
            &decode_body,
        )
        .await
        {
            Ok(res) => res,
            Err(e) => {
                decode.finish(DispatchOutcome::Failure);
                failed.lock().decode.push(decode_worker.id().clone());
                return Err(e);
            }
        };

        let mut response = forward_response(res, decode, req.is_stream())
            .await
            .inspect_err(|_| failed.lock().decode.push(decode_worker.id().clone()))?;
        set_worker_id(
            response.headers_mut(),
            PREFILL_WORKER_ID_HEADER,
            prefill_worker.id(),
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PolicyConfig,
        core::{HealthStatus, PoolRole, Worker},
    };
    use axum::http::HeaderMap;
    use serde_json::json;

    #[tokio::test]
    async fn test_unreachable_prefill_fails_pair_and_releases_decode() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.add(
            Worker::builder("http://127.0.0.1:1")
                .role(PoolRole::Prefill)
                .health(HealthStatus::Healthy)
                .build(),
        );
        registry.add(
            Worker::builder("http://127.0.0.1:2")
                .role(PoolRole::Decode)
                .health(HealthStatus::Healthy)
                .build(),
        );
        let router = PdRouter::new(
            Arc::clone(&registry),
            reqwest::Client::new(),
            PdPolicyResolution::resolve(&PolicyConfig::RoundRobin, None, None),
            RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                backoff_multiplier: 1.0,
                jitter_factor: 0.0,
            },
        );
        let req = RouteRequest::from_json(
            "/v1/completions",
            &HeaderMap::new(),
            json!({"prompt": "hi", "max_tokens": 4}),
        )
        .unwrap();

        let err = router.route(&req).await.unwrap_err();
        assert!(matches!(err, RouterError::RetryExhausted { attempts: 2, .. }));

        let decode = registry.get_by_url("http://127.0.0.1:2").unwrap();
        assert_eq!(decode.load(), 0);
        assert_eq!(decode.circuit_breaker().consecutive_failures(), 0);
        let prefill = registry.get_by_url("http://127.0.0.1:1").unwrap();
        assert_eq!(prefill.circuit_breaker().consecutive_failures(), 2);
    }
}
