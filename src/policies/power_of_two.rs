//! Power-of-two choices load balancing policy

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::SelectWorkerInfo;
use crate::core::{Worker, WorkerSnapshot};

/// Samples two distinct eligible workers and keeps the less loaded one.
///
/// Load is compared on in-flight requests first and the latency moving
/// average second; a worker with no latency sample yet counts as fastest.
#[derive(Debug, Default)]
pub struct PowerOfTwoPolicy;

impl PowerOfTwoPolicy {
    pub fn new() -> Self {
        Self
    }

    fn load_score(worker: &Worker) -> (usize, Duration) {
        (
            worker.load(),
            worker.latency_estimate().unwrap_or(Duration::ZERO),
        )
    }

    pub fn select_worker(
        &self,
        snapshot: &WorkerSnapshot,
        _info: &SelectWorkerInfo<'_>,
    ) -> Option<usize> {
        let len = snapshot.len();
        match len {
            0 => return None,
            1 => return Some(0),
            _ => {}
        }

        // Offset by 1 + rand(len - 1) guarantees a distinct second pick
        let mut rng = rand::rng();
        let idx1 = rng.random_range(0..len);
        let idx2 = (idx1 + 1 + rng.random_range(0..len - 1)) % len;

        let workers = snapshot.workers();
        let score1 = Self::load_score(&workers[idx1]);
        let score2 = Self::load_score(&workers[idx2]);
        let selected = if score1 <= score2 { idx1 } else { idx2 };

        debug!(
            "Power-of-two selection: {}={:?} vs {}={:?} -> {}",
            workers[idx1].url(),
            score1,
            workers[idx2].url(),
            score2,
            workers[selected].url()
        );

        Some(selected)
    }
}
