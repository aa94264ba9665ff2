use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, RngExt, SeedableRng};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cycle::{CycleId, CycleManager};
use crate::errors::SimError;
use crate::fingerprint::fingerprint;
use crate::progress::{ProgressStatus, ProgressStore};
use crate::simulator::{FlightProfile, Trajectory};
use crate::simulator_cache::{CacheMode, K_ENS, SimulatorCache};

/// Batched progress flushes: whichever comes first.
const FLUSH_EVERY: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// One slot of the `paths` array. Failures are masked at slot granularity
/// so a partial ensemble is still usable; the transport maps the non-path
/// variants to the `"alt error"` / `"error"` wire sentinels.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    Path(Trajectory),
    OutOfDomain,
    Failed,
}

impl Serialize for FlightOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FlightOutcome::Path(trajectory) => trajectory.serialize(serializer),
            FlightOutcome::OutOfDomain => serializer.serialize_str("alt error"),
            FlightOutcome::Failed => serializer.serialize_str("error"),
        }
    }
}

/// One landing sample for the client-side heatmap / KDE.
#[derive(Debug, Clone, Serialize)]
pub struct Landing {
    pub lat: f64,
    pub lon: f64,
    /// -1 for the unperturbed control pair of each member.
    pub perturbation_id: i32,
    pub model_id: u8,
    /// Control-ensemble points weigh double in the density estimate.
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsembleResult {
    pub paths: Vec<FlightOutcome>,
    #[serde(rename = "heatmap_data")]
    pub landings: Vec<Landing>,
    pub request_id: String,
}

/// Independent uniform perturbation of one launch, drawn per Monte-Carlo
/// unit. The descent-coefficient draw is the 90/10 mixture over
/// [0.95, 1.0) and [0.9, 0.95); the 0.95 boundary belongs to the high
/// sub-range.
pub fn perturb(profile: &FlightProfile, rng: &mut impl Rng) -> FlightProfile {
    FlightProfile {
        time: profile.time,
        lat: profile.lat + rng.random_range(-0.001..0.001),
        lon: profile.lon + rng.random_range(-0.001..0.001),
        alt: profile.alt + rng.random_range(-50.0..50.0),
        burst_alt: profile.burst_alt + rng.random_range(-200.0..200.0),
        float_hours: profile.float_hours * rng.random_range(0.9..1.1),
        ascent_rate: profile.ascent_rate + rng.random_range(-0.1..0.1),
        descent_rate: profile.descent_rate + rng.random_range(-0.1..0.1),
        coeff: if rng.random::<f64>() < 0.9 {
            rng.random_range(0.95..1.0)
        } else {
            rng.random_range(0.9..0.95)
        },
        step: profile.step,
    }
}

struct UnitDone {
    control: bool,
}

enum UnitOutcome {
    Flight(Box<Trajectory>),
    /// Masked at slot granularity: out-of-domain or any other per-flight
    /// failure.
    Slot(FlightOutcome),
    /// The lease observed a newer cycle than the fan-out started under.
    Flip,
    /// The whole ensemble cannot proceed.
    Abort(SimError),
}

/// Fans one launch out over the full member set plus Monte-Carlo
/// perturbations, with bounded concurrency, batched progress, cooperative
/// cancellation, and a clean restart if the GEFS cycle flips mid-run.
pub struct EnsembleOrchestrator {
    sim_cache: Arc<SimulatorCache>,
    cycles: Arc<CycleManager>,
    progress: Arc<ProgressStore>,
    workers: usize,
    ensemble_ttl: Duration,
}

impl EnsembleOrchestrator {
    pub fn new(
        sim_cache: Arc<SimulatorCache>,
        cycles: Arc<CycleManager>,
        progress: Arc<ProgressStore>,
        workers: usize,
        ensemble_ttl: Duration,
    ) -> Self {
        Self {
            sim_cache,
            cycles,
            progress,
            workers,
            ensemble_ttl,
        }
    }

    /// Run the full ensemble: one control pair per member plus
    /// `num_perturbations` Monte-Carlo pairs, all within `deadline`.
    pub async fn run(
        &self,
        profile: FlightProfile,
        members: &[u8],
        num_perturbations: u32,
        seed: Option<u64>,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<EnsembleResult, SimError> {
        let request_id = fingerprint(&profile.request_key(-1));
        let result = tokio::time::timeout(
            deadline,
            self.run_inner(&request_id, profile, members, num_perturbations, seed, &cancel),
        )
        .await;

        match result {
            Ok(inner) => {
                match &inner {
                    Ok(_) => self.progress.finish(&request_id, ProgressStatus::Complete),
                    Err(SimError::Cancelled) => {
                        self.progress.finish(&request_id, ProgressStatus::Cancelled)
                    }
                    Err(_) => self.progress.finish(&request_id, ProgressStatus::Failed),
                }
                inner
            }
            Err(_) => {
                // Deadline: stop outstanding workers at their next check.
                cancel.cancel();
                self.progress.finish(&request_id, ProgressStatus::Failed);
                Err(SimError::Timeout)
            }
        }
    }

    async fn run_inner(
        &self,
        request_id: &str,
        profile: FlightProfile,
        members: &[u8],
        num_perturbations: u32,
        seed: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<EnsembleResult, SimError> {
        let pairs = num_perturbations as usize + 1;
        let total = (members.len() * pairs) as u32;
        let base_seed = seed.unwrap_or_else(|| rand::rng().random());

        // One clean restart if the active cycle flips under the fan-out;
        // a mixed-cycle result is never assembled.
        for attempt in 0..2 {
            self.progress.start(request_id, total);
            self.sim_cache.set_mode(CacheMode::Ensemble, self.ensemble_ttl);
            let (cycle, epoch) = self.cycles.await_stable().await?;
            info!(
                "ensemble {} fanning out {} units under cycle {} (epoch {})",
                request_id, total, cycle, epoch
            );

            match self
                .fan_out(
                    request_id,
                    &profile,
                    members,
                    num_perturbations,
                    base_seed,
                    &cycle,
                    cancel,
                )
                .await?
            {
                Some((paths, landings)) => {
                    return Ok(EnsembleResult {
                        paths,
                        landings,
                        request_id: request_id.to_string(),
                    });
                }
                None if attempt == 0 => {
                    warn!("cycle flipped under ensemble {}, restarting", request_id);
                    continue;
                }
                None => return Err(SimError::CycleUnavailable),
            }
        }
        unreachable!("restart loop returns within two attempts");
    }

    /// One fan-out attempt. `Ok(None)` means a cycle flip was observed and
    /// the caller should restart.
    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        request_id: &str,
        profile: &FlightProfile,
        members: &[u8],
        num_perturbations: u32,
        base_seed: u64,
        cycle: &CycleId,
        cancel: &CancellationToken,
    ) -> Result<Option<(Vec<FlightOutcome>, Vec<Landing>)>, SimError> {
        let pairs = num_perturbations as usize + 1;

        // Never pin more simulators than ensemble capacity can hold.
        let semaphore = Arc::new(Semaphore::new(K_ENS));
        let (done_tx, done_rx) = mpsc::channel::<UnitDone>(256);
        let batcher = tokio::spawn(progress_batcher(
            done_rx,
            self.progress.clone(),
            request_id.to_string(),
            self.sim_cache.clone(),
        ));

        let units = (0..members.len()).flat_map(|mi| {
            (-1..num_perturbations as i32).map(move |pert| (mi, pert))
        });

        let outcomes: Vec<(usize, i32, UnitOutcome)> = futures_util::stream::iter(units)
            .map(|(mi, pert)| {
                let member = members[mi];
                let profile = *profile;
                let cycle = cycle.clone();
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                let sim_cache = self.sim_cache.clone();
                let done_tx = done_tx.clone();
                async move {
                    let outcome = run_unit(
                        sim_cache, semaphore, profile, member, pert, base_seed, cycle, cancel,
                    )
                    .await;
                    if !matches!(outcome, UnitOutcome::Abort(_) | UnitOutcome::Flip) {
                        let _ = done_tx.send(UnitDone { control: pert == -1 }).await;
                    }
                    (mi, pert, outcome)
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        drop(done_tx);
        let _ = batcher.await;

        if cancel.is_cancelled() {
            return Err(SimError::Cancelled);
        }

        let mut paths: Vec<Option<FlightOutcome>> = vec![None; members.len()];
        let mut landings: Vec<Option<Landing>> = Vec::new();
        landings.resize_with(members.len() * pairs, || None);
        let mut flipped = false;

        for (mi, pert, outcome) in outcomes {
            let slot = mi * pairs + (pert + 1) as usize;
            match outcome {
                UnitOutcome::Flight(trajectory) => {
                    if let Some(point) = trajectory.landing() {
                        landings[slot] = Some(Landing {
                            lat: point.lat,
                            lon: point.lon,
                            perturbation_id: pert,
                            model_id: members[mi],
                            weight: if pert == -1 { 2.0 } else { 1.0 },
                        });
                    }
                    if pert == -1 {
                        paths[mi] = Some(FlightOutcome::Path(*trajectory));
                    }
                }
                UnitOutcome::Slot(masked) => {
                    if pert == -1 {
                        paths[mi] = Some(masked);
                    }
                }
                UnitOutcome::Flip => flipped = true,
                UnitOutcome::Abort(err) => return Err(err),
            }
        }

        if flipped {
            return Ok(None);
        }

        let paths = paths
            .into_iter()
            .map(|p| p.unwrap_or(FlightOutcome::Failed))
            .collect();
        let landings = landings.into_iter().flatten().collect();
        Ok(Some((paths, landings)))
    }
}

/// One three-phase simulation for a `(member, perturbation)` pair.
#[allow(clippy::too_many_arguments)]
async fn run_unit(
    sim_cache: Arc<SimulatorCache>,
    semaphore: Arc<Semaphore>,
    profile: FlightProfile,
    member: u8,
    pert: i32,
    base_seed: u64,
    cycle: CycleId,
    cancel: CancellationToken,
) -> UnitOutcome {
    if cancel.is_cancelled() {
        return UnitOutcome::Abort(SimError::Cancelled);
    }
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return UnitOutcome::Abort(SimError::Cancelled);
    };

    let lease = match sim_cache.acquire(member).await {
        Ok(lease) => lease,
        Err(SimError::CycleUnavailable) => {
            return UnitOutcome::Abort(SimError::CycleUnavailable);
        }
        Err(SimError::Cancelled) => return UnitOutcome::Abort(SimError::Cancelled),
        Err(SimError::OutOfDomain) => return UnitOutcome::Slot(FlightOutcome::OutOfDomain),
        Err(_) => return UnitOutcome::Slot(FlightOutcome::Failed),
    };

    // A lease from a newer cycle means a flip landed mid-run; the whole
    // ensemble restarts rather than mixing cycles.
    if lease.cycle() != &cycle {
        return UnitOutcome::Flip;
    }

    // The control pair flies the nominal profile; every Monte-Carlo pair
    // gets an independent draw, seeded per unit so a fixed seed reproduces
    // the exact ensemble regardless of scheduling.
    let flight_profile = if pert == -1 {
        profile
    } else {
        let unit_seed = base_seed
            ^ ((member as u64) << 32)
            ^ ((pert as u64).wrapping_add(1) << 8);
        let mut rng = StdRng::seed_from_u64(unit_seed);
        perturb(&profile, &mut rng)
    };

    // The integration is pure CPU; keep it off the async workers.
    let flight_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        let result = lease.fly(&flight_profile, &flight_cancel);
        drop(lease);
        result
    })
    .await;

    match result {
        Ok(Ok(trajectory)) => UnitOutcome::Flight(Box::new(trajectory)),
        Ok(Err(SimError::OutOfDomain)) => UnitOutcome::Slot(FlightOutcome::OutOfDomain),
        Ok(Err(SimError::Cancelled)) => UnitOutcome::Abort(SimError::Cancelled),
        Ok(Err(SimError::CycleUnavailable)) => UnitOutcome::Abort(SimError::CycleUnavailable),
        Ok(Err(_)) => UnitOutcome::Slot(FlightOutcome::Failed),
        Err(join_err) => {
            warn!("simulation task for member {} failed: {}", member, join_err);
            UnitOutcome::Slot(FlightOutcome::Failed)
        }
    }
}

/// Accumulates unit completions and flushes them to the progress store
/// every few completions or every quarter second, whichever comes first.
/// Each flush also extends the simulator cache's ensemble mode.
async fn progress_batcher(
    mut rx: mpsc::Receiver<UnitDone>,
    progress: Arc<ProgressStore>,
    request_id: String,
    sim_cache: Arc<SimulatorCache>,
) {
    let mut pending_control = 0u32;
    let mut pending_mc = 0u32;

    let flush = |control: &mut u32, mc: &mut u32| {
        if *control == 0 && *mc == 0 {
            return;
        }
        let (c, m) = (*control, *mc);
        progress.update(&request_id, |p| {
            p.done += c + m;
            p.done_ensemble += c;
            p.done_monte_carlo += m;
        });
        sim_cache.extend_ensemble();
        *control = 0;
        *mc = 0;
    };

    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(done)) => {
                if done.control {
                    pending_control += 1;
                } else {
                    pending_mc += 1;
                }
                if (pending_control + pending_mc) as usize >= FLUSH_EVERY {
                    flush(&mut pending_control, &mut pending_mc);
                }
            }
            Ok(None) => {
                flush(&mut pending_control, &mut pending_mc);
                break;
            }
            Err(_) => flush(&mut pending_control, &mut pending_mc),
        }
    }
}
