//! Random load balancing policy

use rand::Rng;

use super::SelectWorkerInfo;
use crate::core::WorkerSnapshot;

/// Uniform choice among eligible workers
#[derive(Debug, Default)]
pub struct RandomPolicy;

impl RandomPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn select_worker(
        &self,
        snapshot: &WorkerSnapshot,
        _info: &SelectWorkerInfo<'_>,
    ) -> Option<usize> {
        if snapshot.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        Some(rng.random_range(0..snapshot.len()))
    }
}
