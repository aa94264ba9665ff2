use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use habsim::artifact_store::ArtifactStore;
use habsim::config::{Config, ENSEMBLE_MEMBERS};
use habsim::cycle::{CycleManager, CycleState};
use habsim::disk_cache::{DiskCache, ELEVATION_ARTIFACT};
use habsim::elevation::ElevationGrid;
use habsim::prediction_cache::PredictionCache;
use habsim::simulator_cache::SimulatorCache;

/// Warm the local disk cache for the active cycle so the first requests
/// after a deploy do not pay download latency.
pub async fn handle_prefetch(members: Option<String>) -> Result<()> {
    let config = Config::from_env()?;
    let members = parse_members(members.as_deref())?;

    let store = Arc::new(ArtifactStore::from_url(
        &config.bucket_url,
        config.store_token.clone(),
    ));
    let disk = Arc::new(
        DiskCache::new(config.disk_cache_dir(), store.clone(), 32).context("create disk cache")?,
    );

    let elevation_path = disk
        .ensure(ELEVATION_ARTIFACT)
        .await
        .context("fetch elevation artifact")?;
    let elevation = Arc::new(ElevationGrid::open(&elevation_path)?);

    let state = Arc::new(CycleState::new());
    let sim_cache = SimulatorCache::new(disk.clone(), elevation, state.clone());
    let cycles = CycleManager::new(
        store,
        state,
        config.cycle_pointer_path(),
        sim_cache,
        PredictionCache::new(),
        disk.clone(),
        ENSEMBLE_MEMBERS,
    );

    cycles.refresh().await.context("refresh active cycle")?;
    let (cycle, _) = cycles
        .active()
        .map_err(|_| anyhow::anyhow!("no complete cycle available to prefetch"))?;

    info!("prefetching {} members of cycle {}", members.len(), cycle);
    let mut fetched = 0usize;
    for member in &members {
        let name = cycle.wind_artifact(*member);
        match disk.ensure(&name).await {
            Ok(_) => fetched += 1,
            Err(err) => warn!("failed to prefetch {}: {}", name, err),
        }
    }
    info!("prefetched {}/{} wind artifacts", fetched, members.len());
    Ok(())
}

fn parse_members(spec: Option<&str>) -> Result<Vec<u8>> {
    let Some(spec) = spec else {
        return Ok((0..ENSEMBLE_MEMBERS).collect());
    };
    spec.split(',')
        .map(|part| {
            let member: u8 = part.trim().parse().context("member list entry")?;
            anyhow::ensure!(member < ENSEMBLE_MEMBERS, "member {member} out of range");
            Ok(member)
        })
        .collect()
}
