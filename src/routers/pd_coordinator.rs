//! Prefill/decode pair selection
//!
//! Each pool is served by its own policy instance and the two choices are made
//! independently: prefill and decode workers are separate resources with
//! separate load.

use std::sync::Arc;

use crate::{
    config::PdPolicyResolution,
    core::{DispatchGuard, PoolRole, RouterResult, WorkerId, WorkerRegistry},
    policies::{Policy, PolicySelector, SelectWorkerInfo},
};

#[derive(Debug)]
pub struct PdCoordinator {
    selector: PolicySelector,
    prefill_policy: Policy,
    decode_policy: Policy,
    resolution: PdPolicyResolution,
}

impl PdCoordinator {
    /// Build the per-pool policies and surface the resolution notice.
    pub fn new(registry: Arc<WorkerRegistry>, resolution: PdPolicyResolution) -> Self {
        resolution.log();
        Self {
            selector: PolicySelector::new(registry),
            prefill_policy: Policy::from_config(&resolution.prefill),
            decode_policy: Policy::from_config(&resolution.decode),
            resolution,
        }
    }

    pub fn resolution(&self) -> &PdPolicyResolution {
        &self.resolution
    }

    pub fn prefill_policy(&self) -> &Policy {
        &self.prefill_policy
    }

    pub fn decode_policy(&self) -> &Policy {
        &self.decode_policy
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.selector.registry()
    }

    /// Choose a (prefill, decode) pair without claiming either worker.
    pub fn select_pair(&self, info: &SelectWorkerInfo<'_>) -> RouterResult<(WorkerId, WorkerId)> {
        let prefill = self
            .selector
            .select(PoolRole::Prefill, info, &self.prefill_policy)?;
        let decode = self
            .selector
            .select(PoolRole::Decode, info, &self.decode_policy)?;
        Ok((prefill.id().clone(), decode.id().clone()))
    }

    /// Choose and claim a pair. If the decode side cannot be claimed the
    /// prefill claim is released when its guard drops.
    pub fn acquire_pair(
        &self,
        info: &SelectWorkerInfo<'_>,
        avoid_prefill: &[WorkerId],
        avoid_decode: &[WorkerId],
    ) -> RouterResult<(DispatchGuard, DispatchGuard)> {
        let prefill =
            self.selector
                .acquire(PoolRole::Prefill, info, &self.prefill_policy, avoid_prefill)?;
        let decode =
            self.selector
                .acquire(PoolRole::Decode, info, &self.decode_policy, avoid_decode)?;
        Ok((prefill, decode))
    }
}
