//! Round-robin load balancing policy

use std::sync::atomic::{AtomicUsize, Ordering};

use super::SelectWorkerInfo;
use crate::core::WorkerSnapshot;

/// Cycles through eligible workers in registration order.
///
/// The cursor persists across calls. Because it indexes the eligible set of
/// each snapshot, workers that dropped out are skipped without resetting it.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn select_worker(
        &self,
        snapshot: &WorkerSnapshot,
        _info: &SelectWorkerInfo<'_>,
    ) -> Option<usize> {
        if snapshot.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % snapshot.len())
    }

    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}
