use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use habsim::artifact_store::ArtifactStore;
use habsim::config::{Config, ENSEMBLE_MEMBERS};
use habsim::cycle::{CycleManager, CycleState, Refresh};
use habsim::disk_cache::{DiskCache, ELEVATION_ARTIFACT};
use habsim::elevation::ElevationGrid;
use habsim::ensemble::EnsembleOrchestrator;
use habsim::prediction_cache::PredictionCache;
use habsim::progress::ProgressStore;
use habsim::reaper;
use habsim::simulator_cache::SimulatorCache;
use habsim::web::{self, AppState};

/// Local wind-artifact budget: the full member set plus headroom for one
/// cycle overlapping the next.
const DISK_CACHE_CAPACITY: usize = 25;

/// How often the background task compares the remote cycle pointer.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// How long startup waits for a first complete cycle before refusing to
/// operate.
const STARTUP_CYCLE_BUDGET: Duration = Duration::from_secs(60);

pub async fn handle_run() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    let metrics = web::init_metrics();

    let store = Arc::new(ArtifactStore::from_url(
        &config.bucket_url,
        config.store_token.clone(),
    ));
    let disk = Arc::new(
        DiskCache::new(config.disk_cache_dir(), store.clone(), DISK_CACHE_CAPACITY)
            .context("create disk cache")?,
    );

    // The elevation grid is required before any flight can terminate; a
    // store that cannot produce it is an unrecoverable startup failure.
    let elevation_path = disk
        .ensure(ELEVATION_ARTIFACT)
        .await
        .context("fetch elevation artifact")?;
    let elevation = Arc::new(ElevationGrid::open(&elevation_path)?);
    info!(
        "elevation grid loaded: {}x{}",
        elevation.rows(),
        elevation.cols()
    );

    let state = Arc::new(CycleState::new());
    let predictions = PredictionCache::new();
    let sim_cache = SimulatorCache::new(disk.clone(), elevation, state.clone());
    let cycles = Arc::new(CycleManager::new(
        store,
        state,
        config.cycle_pointer_path(),
        sim_cache.clone(),
        predictions.clone(),
        disk,
        ENSEMBLE_MEMBERS,
    ));
    let progress = Arc::new(ProgressStore::new(config.progress_dir())?);

    wait_for_cycle(&cycles).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(refresh_loop(cycles.clone(), shutdown.clone()));
    tokio::spawn(reaper::run_reaper(
        sim_cache.clone(),
        progress.clone(),
        shutdown.clone(),
    ));

    let orchestrator = Arc::new(EnsembleOrchestrator::new(
        sim_cache.clone(),
        cycles.clone(),
        progress.clone(),
        config.workers,
        config.ensemble_ttl,
    ));

    let app = AppState {
        config: config.clone(),
        predictions,
        sim_cache,
        cycles,
        orchestrator,
        progress,
        metrics,
    };

    tokio::spawn(signal_listener(shutdown.clone()));
    web::serve(app, config.port, shutdown).await
}

/// Poll the store until a complete cycle is adopted; exit otherwise. A
/// server with no valid cycle cannot answer anything truthfully.
async fn wait_for_cycle(cycles: &CycleManager) -> Result<()> {
    let deadline = tokio::time::Instant::now() + STARTUP_CYCLE_BUDGET;
    loop {
        match cycles.refresh().await {
            Ok(Refresh::Flipped(cycle)) => {
                info!("startup adopted cycle {}", cycle);
                return Ok(());
            }
            Ok(Refresh::Current) if cycles.active().is_ok() => return Ok(()),
            Ok(Refresh::Pending(cycle)) => {
                info!("cycle {} still uploading, waiting", cycle);
            }
            Ok(Refresh::Current) => {}
            Err(err) => warn!("cycle refresh failed during startup: {err:#}"),
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("refusing to start without a complete forecast cycle");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn refresh_loop(cycles: Arc<CycleManager>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
        }
        match cycles.refresh().await {
            Ok(Refresh::Flipped(cycle)) => info!("flipped to cycle {}", cycle),
            Ok(_) => {}
            Err(err) => error!("cycle refresh failed: {err:#}"),
        }
    }
}

/// Drain in-flight requests on SIGTERM or ctrl-c.
async fn signal_listener(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("ctrl-c received, draining"),
            _ = sigterm.recv() => info!("SIGTERM received, draining"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("ctrl-c received, draining");
    }

    shutdown.cancel();
}
