//! Regular (unified pool) router

use std::sync::Arc;

use axum::response::Response;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    request::RouteRequest,
    upstream::{forward_response, send_json},
};
use crate::{
    config::{PolicyConfig, RetryConfig},
    core::{
        DispatchOutcome, PoolRole, RetryExecutor, RouterResult, WorkerId, WorkerRegistry,
    },
    policies::{Policy, PolicySelector},
};

/// Routes every request to one worker of the unified pool.
#[derive(Debug)]
pub struct Router {
    selector: PolicySelector,
    policy: Policy,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl Router {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        client: reqwest::Client,
        policy: &PolicyConfig,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            selector: PolicySelector::new(registry),
            policy: Policy::from_config(policy),
            client,
            retry_config,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.selector.registry()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Select, dispatch and retry on a different worker while failures are
    /// retryable.
    pub async fn route(&self, req: &RouteRequest) -> RouterResult<Response> {
        let failed: Mutex<Vec<WorkerId>> = Mutex::new(Vec::new());
        let info = req.select_info();

        let result = RetryExecutor::execute_with_retry(
            &self.retry_config,
            |attempt| {
                let failed = &failed;
                async move {
                    let avoid = failed.lock().clone();
                    let guard =
                        self.selector
                            .acquire(PoolRole::Unified, &info, &self.policy, &avoid)?;
                    let worker = Arc::clone(guard.worker());
                    debug!(attempt, worker = %worker.url(), route = req.route(), "Dispatching request");

                    let res = match send_json(
                        &self.client,
                        &worker,
                        req.route(),
                        req.headers(),
                        req.body(),
                    )
                    .await
                    {
                        Ok(res) => res,
                        Err(e) => {
                            guard.finish(DispatchOutcome::Failure);
                            failed.lock().push(worker.id().clone());
                            return Err(e);
                        }
                    };

                    forward_response(res, guard, req.is_stream())
                        .await
                        .inspect_err(|_| failed.lock().push(worker.id().clone()))
                }
            },
            |err, _attempt| err.is_retryable(),
            |err, delay, next_attempt| {
                warn!(
                    route = req.route(),
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    err
                );
            },
        )
        .await;

        result.map_err(Into::into)
    }
}
