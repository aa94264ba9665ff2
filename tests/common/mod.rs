//! Shared fixtures: a synthetic bucket on local disk (wind artifacts,
//! elevation grid, cycle pointer) and the full cache/cycle stack wired
//! over it.
#![allow(dead_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use habsim::artifact_store::{ArtifactStore, DirStore};
use habsim::cycle::{CycleId, CycleManager, CycleState};
use habsim::disk_cache::{DiskCache, ELEVATION_ARTIFACT};
use habsim::elevation::{ElevationGrid, write_grid};
use habsim::prediction_cache::PredictionCache;
use habsim::progress::ProgressStore;
use habsim::simulator::{DEFAULT_STEP, FlightProfile};
use habsim::simulator_cache::SimulatorCache;
use habsim::wind::{WindHeader, write_artifact};

/// Base epoch of every synthetic wind field.
pub const T0: i64 = 1_700_000_000;

pub const CYCLE_A: &str = "2024010100";
pub const CYCLE_B: &str = "2024010106";

pub fn wind_header() -> WindHeader {
    WindHeader {
        n_t: 48,
        n_p: 5,
        n_lat: 19,
        n_lon: 36,
        dt_secs: 3600,
        base: T0,
        levels: vec![1000.0, 500.0, 100.0, 20.0, 10.0],
    }
}

/// Write one member's wind artifact: a uniform field with a small
/// per-member offset so different members land in different places.
pub fn seed_member(remote: &Path, cycle: &str, member: u8, u: f32, v: f32) {
    let header = wind_header();
    let (mu, mv) = (u + member as f32 * 0.1, v + member as f32 * 0.05);
    let values: Vec<f32> = (0..header.values())
        .map(|i| if i % 2 == 0 { mu } else { mv })
        .collect();
    write_artifact(
        &remote.join(format!("{}_{:02}.zst", cycle, member)),
        &header,
        &values,
    )
    .expect("write wind artifact");
}

pub fn seed_cycle(remote: &Path, cycle: &str, members: u8) {
    for member in 0..members {
        seed_member(remote, cycle, member, 5.0, 3.0);
    }
}

pub fn seed_elevation(remote: &Path, ground: i16) {
    write_grid(&remote.join(ELEVATION_ARTIFACT), 91, |_, _| ground).expect("write elevation");
}

pub fn write_pointer(remote: &Path, cycle: &str) {
    std::fs::write(remote.join("active_cycle"), cycle).expect("write cycle pointer");
}

/// The launch of end-to-end scenario 1: San Jose, 30 km burst, no float.
pub fn scenario_profile() -> FlightProfile {
    FlightProfile {
        time: T0 as f64 + 600.0,
        lat: 37.3553,
        lon: -121.8763,
        alt: 10.0,
        burst_alt: 30_000.0,
        float_hours: 0.0,
        ascent_rate: 4.0,
        descent_rate: 8.0,
        coeff: 1.0,
        step: DEFAULT_STEP,
    }
}

pub struct TestStack {
    pub remote: TempDir,
    pub local: TempDir,
    pub store: Arc<ArtifactStore>,
    pub disk: Arc<DiskCache>,
    pub state: Arc<CycleState>,
    pub predictions: PredictionCache,
    pub sim_cache: Arc<SimulatorCache>,
    pub cycles: Arc<CycleManager>,
    pub progress: Arc<ProgressStore>,
}

impl TestStack {
    pub fn cycle_a(&self) -> CycleId {
        CycleId::from_str(CYCLE_A).unwrap()
    }

    pub fn cycle_b(&self) -> CycleId {
        CycleId::from_str(CYCLE_B).unwrap()
    }

    /// Point the remote at another cycle and seed its artifacts.
    pub fn publish_cycle(&self, cycle: &str, members: u8) {
        seed_cycle(self.remote.path(), cycle, members);
        write_pointer(self.remote.path(), cycle);
    }
}

/// Build the full stack over a synthetic bucket seeded with `members`
/// complete members of `CYCLE_A`, flat terrain, and an adopted cycle.
pub async fn stack(members: u8) -> TestStack {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();

    seed_cycle(remote.path(), CYCLE_A, members);
    seed_elevation(remote.path(), 0);
    write_pointer(remote.path(), CYCLE_A);

    let store = Arc::new(ArtifactStore::new(Arc::new(DirStore::new(remote.path()))));
    let disk = Arc::new(
        DiskCache::new(local.path().join("cache"), store.clone(), 25).unwrap(),
    );

    let elevation_path = disk.ensure(ELEVATION_ARTIFACT).await.unwrap();
    let elevation = Arc::new(ElevationGrid::open(&elevation_path).unwrap());

    let state = Arc::new(CycleState::new());
    let predictions = PredictionCache::new();
    let sim_cache = SimulatorCache::new(disk.clone(), elevation, state.clone());

    let mut cycles = CycleManager::new(
        store.clone(),
        state.clone(),
        local.path().join("active_cycle"),
        sim_cache.clone(),
        predictions.clone(),
        disk.clone(),
        members,
    );
    cycles.set_guard_interval(Duration::ZERO);
    let cycles = Arc::new(cycles);

    cycles.refresh().await.expect("initial refresh");
    assert!(cycles.active().is_ok(), "stack starts with an active cycle");

    let progress = Arc::new(ProgressStore::new(local.path().join("progress")).unwrap());

    TestStack {
        remote,
        local,
        store,
        disk,
        state,
        predictions,
        sim_cache,
        cycles,
        progress,
    }
}
