//! Load balancing policies
//!
//! Every policy works on a [`WorkerSnapshot`] of eligible workers and returns
//! the index of its choice. The set of policies is closed, so they are
//! dispatched through the [`Policy`] enum rather than trait objects.

pub mod cache_aware;
pub mod consistent_hash;
pub mod power_of_two;
pub mod random;
pub mod round_robin;
pub mod routing_key;
pub mod utils;

use std::sync::Arc;

use tracing::debug;

pub use cache_aware::{CacheAwareConfig, CacheAwarePolicy};
pub use consistent_hash::ConsistentHashPolicy;
pub use power_of_two::PowerOfTwoPolicy;
pub use random::RandomPolicy;
pub use round_robin::RoundRobinPolicy;
pub use routing_key::RoutingKey;

use crate::{
    config::PolicyConfig,
    core::{
        DispatchGuard, PoolRole, RouterError, RouterResult, Worker, WorkerId, WorkerRegistry,
        WorkerSnapshot,
    },
};

/// Request attributes a policy may look at
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectWorkerInfo<'a> {
    /// Affinity key (session or user), already namespaced
    pub routing_key: Option<&'a str>,
    /// Prompt text used for prefix affinity
    pub request_text: Option<&'a str>,
}

#[derive(Debug)]
pub enum Policy {
    Random(RandomPolicy),
    RoundRobin(RoundRobinPolicy),
    CacheAware(CacheAwarePolicy),
    PowerOfTwo(PowerOfTwoPolicy),
    ConsistentHash(ConsistentHashPolicy),
}

impl Policy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        match config {
            PolicyConfig::Random => Policy::Random(RandomPolicy::new()),
            PolicyConfig::RoundRobin => Policy::RoundRobin(RoundRobinPolicy::new()),
            PolicyConfig::CacheAware { .. } => Policy::CacheAware(CacheAwarePolicy::with_config(
                CacheAwareConfig::from_policy_config(config).unwrap_or_default(),
            )),
            PolicyConfig::PowerOfTwo => Policy::PowerOfTwo(PowerOfTwoPolicy::new()),
            PolicyConfig::ConsistentHash => Policy::ConsistentHash(ConsistentHashPolicy::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Random(_) => "random",
            Policy::RoundRobin(_) => "round_robin",
            Policy::CacheAware(_) => "cache_aware",
            Policy::PowerOfTwo(_) => "power_of_two",
            Policy::ConsistentHash(_) => "consistent_hash",
        }
    }

    /// Index into `snapshot.workers()` of the chosen worker
    pub fn select_worker(
        &self,
        snapshot: &WorkerSnapshot,
        info: &SelectWorkerInfo<'_>,
    ) -> Option<usize> {
        if snapshot.is_empty() {
            return None;
        }
        match self {
            Policy::Random(p) => p.select_worker(snapshot, info),
            Policy::RoundRobin(p) => p.select_worker(snapshot, info),
            Policy::CacheAware(p) => p.select_worker(snapshot, info),
            Policy::PowerOfTwo(p) => p.select_worker(snapshot, info),
            Policy::ConsistentHash(p) => p.select_worker(snapshot, info),
        }
    }
}

/// Turns a policy choice into a claimed dispatch.
#[derive(Debug, Clone)]
pub struct PolicySelector {
    registry: Arc<WorkerRegistry>,
}

impl PolicySelector {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Pick a worker without claiming it.
    pub fn select(
        &self,
        role: PoolRole,
        info: &SelectWorkerInfo<'_>,
        policy: &Policy,
    ) -> RouterResult<Arc<Worker>> {
        let snapshot = self.registry.snapshot(role)?;
        let idx = policy
            .select_worker(&snapshot, info)
            .ok_or(RouterError::NoHealthyWorker { role })?;
        Ok(Arc::clone(&snapshot.workers()[idx]))
    }

    /// Pick a worker and claim a dispatch on it.
    ///
    /// Workers in `avoid` (already tried by this request) are skipped unless
    /// they are the only ones left. A candidate whose breaker refuses the
    /// claim is dropped and the policy chooses again among the rest.
    pub fn acquire(
        &self,
        role: PoolRole,
        info: &SelectWorkerInfo<'_>,
        policy: &Policy,
        avoid: &[WorkerId],
    ) -> RouterResult<DispatchGuard> {
        let base = self.registry.snapshot(role)?.excluding(avoid);
        let mut denied: Vec<WorkerId> = Vec::new();
        let mut first_denied_url: Option<String> = None;

        loop {
            let snapshot = base.without(&denied);
            let Some(idx) = policy.select_worker(&snapshot, info) else {
                return Err(match first_denied_url {
                    Some(worker_url) => RouterError::CircuitOpen { worker_url },
                    None => RouterError::NoHealthyWorker { role },
                });
            };

            let worker = &snapshot.workers()[idx];
            match worker.try_start_dispatch() {
                Some(guard) => {
                    debug!(
                        role = %role,
                        policy = policy.name(),
                        worker = %worker.url(),
                        "Selected worker"
                    );
                    return Ok(guard);
                }
                None => {
                    debug!(worker = %worker.url(), "Circuit refused dispatch, reselecting");
                    first_denied_url.get_or_insert_with(|| worker.url().to_string());
                    denied.push(worker.id().clone());
                }
            }
        }
    }
}
