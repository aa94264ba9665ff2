use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::progress::ProgressStore;
use crate::simulator_cache::SimulatorCache;

const TICK: Duration = Duration::from_secs(30);
/// Faster cadence while ensemble mode is past its deadline, so the raised
/// capacity drains promptly.
const DRAIN_TICK: Duration = Duration::from_secs(10);
/// Without any request activity for this long, reclaim everything evictable.
const DEEP_IDLE: Duration = Duration::from_secs(120);

/// Long-running per-worker task that keeps memory bounded between requests:
/// trims the simulator cache to its capacity target, tears down quiesced
/// evictions, reaps finished progress entries, and performs deeper
/// reclamation once the worker has sat idle.
pub async fn run_reaper(
    sim_cache: Arc<SimulatorCache>,
    progress: Arc<ProgressStore>,
    shutdown: CancellationToken,
) {
    info!("idle reaper running");
    loop {
        let tick = if sim_cache.mode_draining() {
            DRAIN_TICK
        } else {
            TICK
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }

        sim_cache.trim();
        sim_cache.reclaim();
        progress.reap();

        if sim_cache.idle_for() >= DEEP_IDLE {
            debug!("worker idle, running deep reclamation");
            // A second pass picks up entries the trim just evicted once
            // their quiescence elapses on the next tick; the purge hint
            // inside reclaim() returns freed pages either way.
            sim_cache.trim();
            sim_cache.reclaim();
        }
    }
    info!("idle reaper stopped");
}
