//! Consistent-hash routing policy
//!
//! Requests carrying a routing key stick to the worker that owns the key on
//! the role's hash ring. If the owner is not in the eligible set the walk
//! continues clockwise, so only that owner's keys move. Requests without a
//! key are spread by hashing a random key.

use rand::Rng;
use tracing::debug;

use super::SelectWorkerInfo;
use crate::core::WorkerSnapshot;

#[derive(Debug, Default)]
pub struct ConsistentHashPolicy;

impl ConsistentHashPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn select_worker(
        &self,
        snapshot: &WorkerSnapshot,
        info: &SelectWorkerInfo<'_>,
    ) -> Option<usize> {
        if snapshot.is_empty() {
            return None;
        }

        let random_key;
        let key = match info.routing_key {
            Some(key) => key,
            None => {
                random_key = format!("random:{}", rand::rng().random::<u64>());
                &random_key
            }
        };

        let owner = snapshot
            .ring()
            .find(key, |worker| snapshot.contains(worker.id()))?;
        debug!(key = %key, worker = %owner.url(), "Consistent hash selection");

        snapshot.workers().iter().position(|w| w.id() == owner.id())
    }
}
