use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

/// Characters per hashed block.
const BLOCK_CHARS: usize = 32;

/// Approximate record of the request prefixes a worker has served.
///
/// Text is cut into fixed-size character blocks and every cumulative prefix
/// is hashed, so two requests sharing their first `k` blocks share `k`
/// entries. Lookup walks the prefixes in order and stops at the first miss.
#[derive(Debug)]
pub struct PrefixCache {
    /// prefix hash -> last-use tick
    entries: DashMap<u64, u64>,
    clock: AtomicU64,
    max_entries: usize,
}

impl PrefixCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fraction of `text` (in characters) covered by the longest cached prefix.
    pub fn match_ratio(&self, text: &str) -> f32 {
        let prefixes = prefix_hashes(text);
        let Some(&(_, total)) = prefixes.last() else {
            return 0.0;
        };

        let tick = self.tick();
        let mut matched = 0usize;
        for (hash, covered) in prefixes {
            match self.entries.get_mut(&hash) {
                Some(mut last_used) => {
                    *last_used = tick;
                    matched = covered;
                }
                None => break,
            }
        }
        matched as f32 / total as f32
    }

    /// Record that `text` was routed to this worker.
    pub fn insert(&self, text: &str) {
        let tick = self.tick();
        for (hash, _) in prefix_hashes(text) {
            self.entries.insert(hash, tick);
        }
        if self.entries.len() > self.max_entries {
            self.evict();
        }
    }

    /// Drop least recently used entries until the cache is back under 90% of capacity.
    pub fn evict(&self) {
        let target = self.max_entries - self.max_entries / 10;
        if self.entries.len() <= target {
            return;
        }

        let mut by_age: Vec<(u64, u64)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        by_age.sort_unstable_by_key(|&(_, tick)| tick);

        let excess = by_age.len().saturating_sub(target);
        for (hash, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&hash);
        }
        debug!(evicted = excess, remaining = self.entries.len(), "Prefix cache eviction");
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

/// Hash of every cumulative block prefix together with the number of characters it covers.
fn prefix_hashes(text: &str) -> Vec<(u64, usize)> {
    let mut hasher = blake3::Hasher::new();
    let mut out = Vec::new();
    let mut covered = 0usize;
    let mut block_start = 0usize;
    let mut chars_in_block = 0usize;

    for (byte_idx, ch) in text.char_indices() {
        chars_in_block += 1;
        if chars_in_block == BLOCK_CHARS {
            let block_end = byte_idx + ch.len_utf8();
            hasher.update(&text.as_bytes()[block_start..block_end]);
            covered += chars_in_block;
            out.push((digest_u64(&hasher), covered));
            block_start = block_end;
            chars_in_block = 0;
        }
    }
    if chars_in_block > 0 {
        hasher.update(&text.as_bytes()[block_start..]);
        covered += chars_in_block;
        out.push((digest_u64(&hasher), covered));
    }
    out
}

fn digest_u64(hasher: &blake3::Hasher) -> u64 {
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
