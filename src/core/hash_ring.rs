//! Consistent hash ring over one worker pool.
//!
//! Each worker is placed at `VIRTUAL_NODES_PER_WORKER` positions derived from
//! `blake3(url#vnode)`. Keys hash onto the ring and walk clockwise to the first
//! eligible worker, so a membership change only moves the keys owned by the
//! worker that joined or left (about 1/N of them).
//!
//! Rings are immutable. The registry builds a fresh ring on every membership
//! change and publishes it as a new `Arc`, so a lookup always completes against
//! the snapshot it started with.

use std::{collections::HashSet, sync::Arc};

use super::worker::Worker;

/// Number of virtual nodes per physical worker
pub const VIRTUAL_NODES_PER_WORKER: usize = 150;

#[derive(Debug, Clone)]
pub struct HashRing {
    /// Sorted by ring position
    entries: Arc<[(u64, Arc<Worker>)]>,
    worker_count: usize,
}

impl HashRing {
    pub fn new(workers: &[Arc<Worker>]) -> Self {
        let mut entries: Vec<(u64, Arc<Worker>)> =
            Vec::with_capacity(workers.len() * VIRTUAL_NODES_PER_WORKER);

        for worker in workers {
            for vnode in 0..VIRTUAL_NODES_PER_WORKER {
                let pos = Self::hash_position(&format!("{}#{}", worker.url(), vnode));
                entries.push((pos, Arc::clone(worker)));
            }
        }
        entries.sort_unstable_by_key(|(pos, _)| *pos);

        Self {
            entries: Arc::from(entries.into_boxed_slice()),
            worker_count: workers.len(),
        }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Stable 64-bit ring position for a string.
    #[inline]
    pub fn hash_position(s: &str) -> u64 {
        let hash = blake3::hash(s.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    /// First worker clockwise from `key` that satisfies `is_eligible`.
    pub fn find<F>(&self, key: &str, is_eligible: F) -> Option<&Arc<Worker>>
    where
        F: Fn(&Worker) -> bool,
    {
        if self.entries.is_empty() {
            return None;
        }

        let key_pos = Self::hash_position(key);
        let start = self.entries.partition_point(|(pos, _)| *pos < key_pos);

        let mut checked: HashSet<&str> = HashSet::with_capacity(self.worker_count.min(16));
        for i in 0..self.entries.len() {
            let (_, worker) = &self.entries[(start + i) % self.entries.len()];
            if !checked.insert(worker.id().as_str()) {
                continue;
            }
            if is_eligible(worker) {
                return Some(worker);
            }
            if checked.len() == self.worker_count {
                break;
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ring entries, virtual nodes included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}
