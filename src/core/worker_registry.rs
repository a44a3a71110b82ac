//! Worker registry
//!
//! Owns every registered worker and the per-role views routing reads from.
//!
//! The role index holds immutable `Arc<[Arc<Worker>]>` snapshots and each role
//! has a pre-built [`HashRing`]. Membership changes build new snapshots and
//! swap them in (copy-on-write), so readers never take a lock and never see a
//! half-updated ring. Per-worker counters live on the worker itself as atomics.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    error::{RouterError, RouterResult},
    hash_ring::HashRing,
    worker::{DispatchGuard, DispatchOutcome, HealthStatus, PoolRole, Worker, WorkerId},
    CircuitState,
};

/// Point-in-time view of the workers a policy may pick from.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    role: PoolRole,
    /// Eligible workers in registration order
    workers: Vec<Arc<Worker>>,
    /// Ring over the whole role pool, eligible or not
    ring: Arc<HashRing>,
}

impl WorkerSnapshot {
    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.iter().any(|w| w.id() == id)
    }

    /// Same view without the given workers (possibly empty).
    pub fn without(&self, excluded: &[WorkerId]) -> WorkerSnapshot {
        WorkerSnapshot {
            role: self.role,
            workers: self
                .workers
                .iter()
                .filter(|w| !excluded.contains(w.id()))
                .cloned()
                .collect(),
            ring: Arc::clone(&self.ring),
        }
    }

    /// Like [`Self::without`], but keeps the full view if nothing would remain.
    pub fn excluding(&self, excluded: &[WorkerId]) -> WorkerSnapshot {
        if excluded.is_empty() {
            return self.clone();
        }
        let remaining = self.without(excluded);
        if remaining.is_empty() {
            return self.clone();
        }
        remaining
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerRegistryStats {
    pub total_workers: usize,
    pub unified_workers: usize,
    pub prefill_workers: usize,
    pub decode_workers: usize,
    pub healthy_workers: usize,
    pub unhealthy_workers: usize,
    pub unknown_workers: usize,
    pub open_circuits: usize,
    pub total_load: usize,
}

/// Members of one role together with the ring built from them.
/// Published as a unit so readers always see a matching pair.
#[derive(Debug)]
struct RolePool {
    /// Registration order
    workers: Arc<[Arc<Worker>]>,
    ring: Arc<HashRing>,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<Worker>>,
    url_to_id: DashMap<String, WorkerId>,
    /// Copy-on-write role index
    pools: DashMap<PoolRole, Arc<RolePool>>,
    /// Serializes membership changes; never taken on the request path
    membership: Mutex<()>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Adding a URL that is already registered returns the
    /// existing id and leaves the registry unchanged.
    pub fn add(&self, worker: Worker) -> WorkerId {
        let _membership = self.membership.lock();

        if let Some(existing) = self.url_to_id.get(worker.url()) {
            warn!(url = %worker.url(), worker_id = %existing.value(), "Worker already registered");
            return existing.clone();
        }

        let worker = Arc::new(worker);
        let id = worker.id().clone();
        let role = worker.role();

        self.workers.insert(id.clone(), Arc::clone(&worker));
        self.url_to_id.insert(worker.url().to_string(), id.clone());

        let mut pool: Vec<Arc<Worker>> = self.workers_for(role).iter().cloned().collect();
        pool.push(Arc::clone(&worker));
        self.publish(role, pool);

        info!(worker_id = %id, url = %worker.url(), role = %role, "Added worker");
        id
    }

    pub fn remove(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        let _membership = self.membership.lock();

        let (_, worker) = self.workers.remove(id)?;
        self.url_to_id.remove(worker.url());

        let role = worker.role();
        let pool: Vec<Arc<Worker>> = self
            .workers_for(role)
            .iter()
            .filter(|w| w.id() != id)
            .cloned()
            .collect();
        self.publish(role, pool);

        // In-flight selections may still hold this worker; keep them away from it
        worker.set_health(HealthStatus::Unhealthy);
        info!(worker_id = %id, url = %worker.url(), role = %role, "Removed worker");
        Some(worker)
    }

    pub fn remove_by_url(&self, url: &str) -> Option<Arc<Worker>> {
        let id = self.url_to_id.get(url).map(|id| id.clone())?;
        self.remove(&id)
    }

    fn publish(&self, role: PoolRole, pool: Vec<Arc<Worker>>) {
        let ring = Arc::new(HashRing::new(&pool));
        let workers: Arc<[Arc<Worker>]> = Arc::from(pool.into_boxed_slice());
        self.pools.insert(role, Arc::new(RolePool { workers, ring }));
    }

    fn pool(&self, role: PoolRole) -> Option<Arc<RolePool>> {
        self.pools.get(&role).map(|pool| Arc::clone(&pool))
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|entry| Arc::clone(&entry))
    }

    pub fn get_by_url(&self, url: &str) -> Option<Arc<Worker>> {
        self.url_to_id.get(url).and_then(|id| self.get(&id))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All workers, grouped by role in registration order
    pub fn all(&self) -> Vec<Arc<Worker>> {
        [PoolRole::Unified, PoolRole::Prefill, PoolRole::Decode]
            .into_iter()
            .flat_map(|role| self.workers_for(role).iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Every registered worker of a role, eligible or not
    pub fn workers_for(&self, role: PoolRole) -> Arc<[Arc<Worker>]> {
        self.pool(role)
            .map(|pool| Arc::clone(&pool.workers))
            .unwrap_or_else(|| Arc::from(Vec::new().into_boxed_slice()))
    }

    pub fn ring_for(&self, role: PoolRole) -> Arc<HashRing> {
        self.pool(role)
            .map(|pool| Arc::clone(&pool.ring))
            .unwrap_or_else(|| Arc::new(HashRing::empty()))
    }

    /// Eligible workers of a role.
    ///
    /// Healthy workers are preferred; workers still in `Unknown` state are
    /// offered only when no Healthy worker is eligible. Fails with
    /// `CircuitOpen` when every otherwise usable worker has an open circuit,
    /// and with `NoHealthyWorker` otherwise.
    pub fn snapshot(&self, role: PoolRole) -> RouterResult<WorkerSnapshot> {
        let Some(pool) = self.pool(role) else {
            return Err(RouterError::NoHealthyWorker { role });
        };

        let mut healthy = Vec::with_capacity(pool.workers.len());
        let mut unknown = Vec::new();
        let mut circuit_blocked: Option<&Arc<Worker>> = None;

        for worker in pool.workers.iter() {
            let health = worker.health();
            if health == HealthStatus::Unhealthy {
                continue;
            }
            if !worker.circuit_breaker().is_available() {
                circuit_blocked.get_or_insert(worker);
                continue;
            }
            match health {
                HealthStatus::Healthy => healthy.push(Arc::clone(worker)),
                _ => unknown.push(Arc::clone(worker)),
            }
        }

        let workers = if healthy.is_empty() { unknown } else { healthy };
        if workers.is_empty() {
            return Err(match circuit_blocked {
                Some(worker) => RouterError::CircuitOpen {
                    worker_url: worker.url().to_string(),
                },
                None => RouterError::NoHealthyWorker { role },
            });
        }

        Ok(WorkerSnapshot {
            role,
            workers,
            ring: Arc::clone(&pool.ring),
        })
    }

    /// Claim a breaker permit for `id` and count the dispatch as in flight.
    pub fn record_dispatch_start(&self, id: &WorkerId) -> RouterResult<DispatchGuard> {
        let worker = self
            .get(id)
            .ok_or_else(|| RouterError::WorkerNotFound(id.to_string()))?;
        worker
            .try_start_dispatch()
            .ok_or_else(|| RouterError::CircuitOpen {
                worker_url: worker.url().to_string(),
            })
    }

    /// Close a dispatch opened by [`Self::record_dispatch_start`].
    pub fn record_dispatch_end(&self, guard: DispatchGuard, outcome: DispatchOutcome) {
        guard.finish(outcome);
    }

    pub fn stats(&self) -> WorkerRegistryStats {
        let mut stats = WorkerRegistryStats::default();
        for entry in self.workers.iter() {
            let worker = entry.value();
            stats.total_workers += 1;
            stats.total_load += worker.load();
            match worker.role() {
                PoolRole::Unified => stats.unified_workers += 1,
                PoolRole::Prefill => stats.prefill_workers += 1,
                PoolRole::Decode => stats.decode_workers += 1,
            }
            match worker.health() {
                HealthStatus::Healthy => stats.healthy_workers += 1,
                HealthStatus::Unhealthy => stats.unhealthy_workers += 1,
                HealthStatus::Unknown => stats.unknown_workers += 1,
            }
            if worker.circuit_breaker().state() == CircuitState::Open {
                stats.open_circuits += 1;
            }
        }
        stats
    }
}
