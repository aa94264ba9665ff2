use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::simulator::Trajectory;

const CAPACITY: u64 = 200;
const TTL: Duration = Duration::from_secs(3600);

/// Cache of computed trajectories keyed by request fingerprint.
///
/// Entries live at most an hour and the whole cache is cleared on every
/// cycle flip, so a cached path can never mix cycles with a fresh one.
#[derive(Clone)]
pub struct PredictionCache {
    cache: Cache<String, Arc<Trajectory>>,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(CAPACITY)
                .time_to_live(TTL)
                .build(),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<Trajectory>> {
        let hit = self.cache.get(fingerprint);
        if hit.is_some() {
            metrics::counter!("prediction_cache.hits").increment(1);
        } else {
            metrics::counter!("prediction_cache.misses").increment(1);
        }
        hit
    }

    pub fn insert(&self, fingerprint: String, trajectory: Arc<Trajectory>) {
        self.cache.insert(fingerprint, trajectory);
    }

    /// Drop everything; called on cycle flips.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn len(&self) -> usize {
        self.cache.run_pending_tasks();
        self.cache.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new()
    }
}
