/*
    Cache-aware load balancing

    Every worker keeps an approximate record of the request prefixes routed to
    it (see `PrefixCache`). For each request:

    1. Score every eligible worker by the fraction of the request text its
       cache already covers, and find the least loaded worker.

    2. If the best score is above `cache_threshold`, prefer that worker unless
       its load is out of balance with the least loaded one:
           best_load - min_load > balance_abs_threshold
           AND best_load > min_load * balance_rel_threshold
       in which case the least loaded worker wins.

    3. Below the threshold there is no useful affinity, so the least loaded
       worker is used.

    The chosen worker records the request text, so follow-up requests sharing
    the prefix are drawn back to it.
*/

use tracing::debug;

use super::SelectWorkerInfo;
use crate::{config::PolicyConfig, core::WorkerSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheAwareConfig {
    pub cache_threshold: f32,
    pub balance_abs_threshold: usize,
    pub balance_rel_threshold: f32,
    pub max_tree_size: usize,
}

impl Default for CacheAwareConfig {
    fn default() -> Self {
        Self {
            cache_threshold: 0.5,
            balance_abs_threshold: 32,
            balance_rel_threshold: 1.1,
            max_tree_size: 10_000,
        }
    }
}

impl CacheAwareConfig {
    pub fn from_policy_config(policy: &PolicyConfig) -> Option<Self> {
        match policy {
            PolicyConfig::CacheAware {
                cache_threshold,
                balance_abs_threshold,
                balance_rel_threshold,
                max_tree_size,
            } => Some(Self {
                cache_threshold: *cache_threshold,
                balance_abs_threshold: *balance_abs_threshold,
                balance_rel_threshold: *balance_rel_threshold,
                max_tree_size: *max_tree_size,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheAwarePolicy {
    config: CacheAwareConfig,
}

impl CacheAwarePolicy {
    pub fn new() -> Self {
        Self::with_config(CacheAwareConfig::default())
    }

    pub fn with_config(config: CacheAwareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CacheAwareConfig {
        &self.config
    }

    fn is_imbalanced(&self, load: usize, min_load: usize) -> bool {
        load.saturating_sub(min_load) > self.config.balance_abs_threshold
            && (load as f32) > (min_load as f32 * self.config.balance_rel_threshold)
    }

    pub fn select_worker(
        &self,
        snapshot: &WorkerSnapshot,
        info: &SelectWorkerInfo<'_>,
    ) -> Option<usize> {
        let workers = snapshot.workers();
        if workers.is_empty() {
            return None;
        }

        let min_load_idx = (0..workers.len()).min_by_key(|&idx| workers[idx].load())?;
        let text = info.request_text.unwrap_or("");

        let selected = if text.is_empty() {
            min_load_idx
        } else {
            // Highest score wins; ties go to the less loaded worker
            let (best_idx, best_score) = workers
                .iter()
                .enumerate()
                .map(|(idx, w)| (idx, w.cache_score(text)))
                .fold((min_load_idx, f32::MIN), |best, (idx, score)| {
                    let better = score > best.1
                        || (score == best.1 && workers[idx].load() < workers[best.0].load());
                    if better {
                        (idx, score)
                    } else {
                        best
                    }
                });

            if best_score > self.config.cache_threshold {
                let best_load = workers[best_idx].load();
                let min_load = workers[min_load_idx].load();
                if self.is_imbalanced(best_load, min_load) {
                    debug!(
                        "Cache-aware: {} has affinity {:.2} but load {} vs {}, using least loaded {}",
                        workers[best_idx].url(),
                        best_score,
                        best_load,
                        min_load,
                        workers[min_load_idx].url()
                    );
                    min_load_idx
                } else {
                    best_idx
                }
            } else {
                min_load_idx
            }
        };

        if !text.is_empty() {
            workers[selected].record_cached_prefix(text);
        }
        Some(selected)
    }
}
