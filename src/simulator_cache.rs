use dashmap::DashMap;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cycle::{CycleId, CycleState};
use crate::disk_cache::DiskCache;
use crate::elevation::ElevationGrid;
use crate::errors::{SimError, StoreError};
use crate::simulator::Simulator;
use crate::wind::{AccessMode, WindFile};

/// Capacity outside ensemble mode.
pub const K_NORM: usize = 8;
/// Capacity while an ensemble fan-out is active.
pub const K_ENS: usize = 25;

/// How long a fully released, evicted simulator lingers before teardown.
/// Catches stragglers that raced an eviction.
const QUIESCENCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Normal,
    Ensemble,
}

type Key = (CycleId, u8);

struct Entry {
    id: u64,
    sim: Arc<Simulator>,
    artifact: String,
    in_use: usize,
}

/// An entry evicted or cycle-invalidated while leases were still out.
struct Zombie {
    sim: Arc<Simulator>,
    artifact: String,
    in_use: usize,
}

struct Pending {
    sim: Arc<Simulator>,
    artifact: String,
    since: Instant,
}

struct Inner {
    entries: HashMap<Key, Entry>,
    /// Access order, most recent last.
    recency: Vec<Key>,
    zombies: HashMap<u64, Zombie>,
    pending: Vec<Pending>,
    mode: CacheMode,
    mode_deadline: Instant,
    mode_ttl: Duration,
    next_id: u64,
}

/// In-process LRU of simulators keyed by `(cycle, member)`.
///
/// Callers never see the map: `acquire` hands out leases that pin the entry
/// in use and release on drop. Only one task builds a given simulator
/// (per-key build lock); build I/O runs outside the cache lock. Entries
/// invalidated by a cycle flip or evicted while leased are torn down after
/// their last lease drops plus a short quiescence delay, with the resident
/// tensor released ahead of the handle and an allocator purge after.
pub struct SimulatorCache {
    me: Weak<SimulatorCache>,
    inner: StdMutex<Inner>,
    build_locks: DashMap<Key, Arc<tokio::sync::Mutex<()>>>,
    disk: Arc<DiskCache>,
    elevation: Arc<ElevationGrid>,
    state: Arc<CycleState>,
    last_activity: StdMutex<Instant>,
    k_norm: usize,
    k_ens: usize,
}

impl SimulatorCache {
    pub fn new(
        disk: Arc<DiskCache>,
        elevation: Arc<ElevationGrid>,
        state: Arc<CycleState>,
    ) -> Arc<Self> {
        Self::with_capacities(disk, elevation, state, K_NORM, K_ENS)
    }

    pub fn with_capacities(
        disk: Arc<DiskCache>,
        elevation: Arc<ElevationGrid>,
        state: Arc<CycleState>,
        k_norm: usize,
        k_ens: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: StdMutex::new(Inner {
                entries: HashMap::new(),
                recency: Vec::new(),
                zombies: HashMap::new(),
                pending: Vec::new(),
                mode: CacheMode::Normal,
                mode_deadline: Instant::now(),
                mode_ttl: Duration::from_secs(60),
                next_id: 0,
            }),
            build_locks: DashMap::new(),
            disk,
            elevation,
            state,
            last_activity: StdMutex::new(Instant::now()),
            k_norm,
            k_ens,
        })
    }

    fn strong(&self) -> Arc<SimulatorCache> {
        self.me.upgrade().expect("cache outlives its leases")
    }

    /// Acquire the simulator for `member` under the active cycle, building
    /// it on a miss. The returned lease keeps the entry pinned until drop;
    /// its cycle is the active cycle at the moment of acquisition.
    pub async fn acquire(&self, member: u8) -> Result<SimulatorLease, SimError> {
        *self.last_activity.lock().unwrap() = Instant::now();

        // A cycle flip can land between resolving the active cycle and
        // finishing a build; retry against the new cycle when it does.
        for _ in 0..3 {
            let (cycle, _) = self.state.active().ok_or(SimError::CycleUnavailable)?;
            if let Some(lease) = self.try_cached(&cycle, member) {
                metrics::counter!("simulator_cache.hits").increment(1);
                return Ok(lease);
            }
            metrics::counter!("simulator_cache.misses").increment(1);

            let key = (cycle.clone(), member);
            let build_lock = self
                .build_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = build_lock.lock().await;

            // Someone may have built it while we waited on the lock.
            if let Some(lease) = self.try_cached(&cycle, member) {
                return Ok(lease);
            }

            let mode = self.access_mode();
            let artifact = cycle.wind_artifact(member);
            let sim = match self.build(&cycle, member, &artifact, mode).await {
                Ok(sim) => sim,
                Err(first) => {
                    // One retry after a local cache bust; a truncated or
                    // stale artifact on disk is the common cause.
                    warn!(
                        "simulator build for {} member {} failed ({}), retrying after cache bust",
                        cycle, member, first
                    );
                    self.disk.bust(&artifact);
                    self.build(&cycle, member, &artifact, mode).await?
                }
            };

            self.disk.pin(&artifact);
            let lease = self.insert(key, sim, artifact);

            // Never hand out a simulator for a cycle that flipped away
            // while we were building.
            let now_active = self.state.active().map(|(c, _)| c);
            if now_active.as_ref() == Some(lease.cycle()) {
                return Ok(lease);
            }
            drop(lease);
            if let Some(active) = now_active {
                self.invalidate_foreign(&active);
            }
        }
        Err(SimError::CycleUnavailable)
    }

    async fn build(
        &self,
        cycle: &CycleId,
        member: u8,
        artifact: &str,
        mode: AccessMode,
    ) -> Result<Simulator, SimError> {
        let start = Instant::now();
        let path = self.disk.ensure(artifact).await.map_err(|e| match e {
            StoreError::NotFound(name) => SimError::ArtifactMissing(name),
            other => SimError::SimulatorBuildFailed {
                member,
                reason: other.to_string(),
            },
        })?;

        // Decompression and tensor loads are blocking work.
        let wind = tokio::task::spawn_blocking(move || WindFile::open(&path, mode))
            .await
            .map_err(|e| SimError::SimulatorBuildFailed {
                member,
                reason: format!("build task failed: {e}"),
            })?
            .map_err(|e| match e {
                SimError::SimulatorBuildFailed { reason, .. } => {
                    SimError::SimulatorBuildFailed { member, reason }
                }
                other => other,
            })?;

        metrics::histogram!("simulator_cache.build_seconds")
            .record(start.elapsed().as_secs_f64());
        Ok(Simulator::new(
            wind,
            self.elevation.clone(),
            cycle.clone(),
            member,
        ))
    }

    fn try_cached(&self, cycle: &CycleId, member: u8) -> Option<SimulatorLease> {
        let key = (cycle.clone(), member);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(&key)?;
        entry.in_use += 1;
        let lease = SimulatorLease {
            cache: self.strong(),
            key: key.clone(),
            id: entry.id,
            sim: entry.sim.clone(),
        };
        inner.recency.retain(|k| k != &key);
        inner.recency.push(key);
        Some(lease)
    }

    fn insert(&self, key: Key, sim: Simulator, artifact: String) -> SimulatorLease {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        let sim = Arc::new(sim);
        inner.entries.insert(
            key.clone(),
            Entry {
                id,
                sim: sim.clone(),
                artifact,
                in_use: 1,
            },
        );
        inner.recency.retain(|k| k != &key);
        inner.recency.push(key.clone());

        let capacity = capacity_of(&inner, self.k_norm, self.k_ens);
        Self::evict_to(&mut inner, capacity);
        metrics::gauge!("simulator_cache.entries").set(inner.entries.len() as f64);

        SimulatorLease {
            cache: self.strong(),
            key,
            id,
            sim,
        }
    }

    /// Evict least-recently-used unleased entries until within `capacity`.
    fn evict_to(inner: &mut Inner, capacity: usize) {
        while inner.entries.len() > capacity {
            let victim = inner
                .recency
                .iter()
                .find(|k| inner.entries.get(*k).is_some_and(|e| e.in_use == 0))
                .cloned();
            let Some(key) = victim else {
                // Every entry is leased; the fan-out semaphore keeps this
                // bounded, so just run over capacity until releases land.
                warn!("simulator cache over capacity with all entries leased");
                return;
            };
            debug!("evicting simulator {}:{:02}", key.0, key.1);
            Self::drop_entry(inner, &key);
        }
    }

    /// Remove an entry from the live map, routing it to pending teardown
    /// or the zombie set depending on outstanding leases.
    fn drop_entry(inner: &mut Inner, key: &Key) {
        let Some(entry) = inner.entries.remove(key) else {
            return;
        };
        inner.recency.retain(|k| k != key);
        if entry.in_use == 0 {
            inner.pending.push(Pending {
                sim: entry.sim,
                artifact: entry.artifact,
                since: Instant::now(),
            });
        } else {
            inner.zombies.insert(
                entry.id,
                Zombie {
                    sim: entry.sim,
                    artifact: entry.artifact,
                    in_use: entry.in_use,
                },
            );
        }
    }

    fn release(&self, key: &Key, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(key)
            && entry.id == id
        {
            entry.in_use = entry.in_use.saturating_sub(1);
            return;
        }
        if let Some(zombie) = inner.zombies.get_mut(&id) {
            zombie.in_use = zombie.in_use.saturating_sub(1);
            if zombie.in_use == 0 {
                let zombie = inner.zombies.remove(&id).unwrap();
                inner.pending.push(Pending {
                    sim: zombie.sim,
                    artifact: zombie.artifact,
                    since: Instant::now(),
                });
            }
        }
    }

    /// Switch capacity mode. Ensemble mode lingers for `ttl` and is
    /// extended by further ensemble activity.
    pub fn set_mode(&self, mode: CacheMode, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        match mode {
            CacheMode::Ensemble => {
                inner.mode = CacheMode::Ensemble;
                inner.mode_ttl = ttl;
                inner.mode_deadline = inner.mode_deadline.max(Instant::now() + ttl);
                info!("simulator cache in ensemble mode for {:?}", ttl);
            }
            CacheMode::Normal => {
                inner.mode = CacheMode::Normal;
            }
        }
    }

    pub fn mode(&self) -> CacheMode {
        let inner = self.inner.lock().unwrap();
        effective_mode(&inner)
    }

    /// True while ensemble mode is set but past its deadline; the reaper
    /// polls faster during the drain.
    pub fn mode_draining(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.mode == CacheMode::Ensemble && Instant::now() >= inner.mode_deadline
    }

    /// Access mode for newly built wind files: resident tensors while an
    /// ensemble is hammering the interpolator, lazily mapped otherwise.
    pub fn access_mode(&self) -> AccessMode {
        match self.mode() {
            CacheMode::Ensemble => AccessMode::Resident,
            CacheMode::Normal => AccessMode::Mapped,
        }
    }

    /// Extend the ensemble-mode deadline; further ensemble activity keeps
    /// the raised capacity alive.
    pub fn extend_ensemble(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == CacheMode::Ensemble {
            let ttl = inner.mode_ttl;
            inner.mode_deadline = inner.mode_deadline.max(Instant::now() + ttl);
        }
    }

    /// Mark every entry whose cycle differs from `cycle` as foreign. They
    /// are never returned again and are reclaimed once unleased.
    pub fn invalidate_foreign(&self, cycle: &CycleId) {
        self.build_locks.retain(|(c, _), _| c == cycle);
        let mut inner = self.inner.lock().unwrap();
        let foreign: Vec<Key> = inner
            .entries
            .keys()
            .filter(|(c, _)| c != cycle)
            .cloned()
            .collect();
        if !foreign.is_empty() {
            info!(
                "invalidating {} simulators from cycles other than {}",
                foreign.len(),
                cycle
            );
        }
        for key in foreign {
            Self::drop_entry(&mut inner, &key);
        }
    }

    /// Trim back to the current capacity target; flips an expired ensemble
    /// mode back to normal. Called by the idle reaper.
    pub fn trim(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == CacheMode::Ensemble && Instant::now() >= inner.mode_deadline {
            info!("ensemble mode expired, trimming simulator cache");
            inner.mode = CacheMode::Normal;
        }
        let capacity = capacity_of(&inner, self.k_norm, self.k_ens);
        Self::evict_to(&mut inner, capacity);
    }

    /// Tear down quiesced evictions: release resident tensors, unpin disk
    /// artifacts, then hint the allocator to return freed pages.
    pub fn reclaim(&self) {
        let ready: Vec<Pending> = {
            let mut inner = self.inner.lock().unwrap();
            let all = std::mem::take(&mut inner.pending);
            let (ready, keep): (Vec<_>, Vec<_>) =
                all.into_iter().partition(|p| p.since.elapsed() >= QUIESCENCE);
            inner.pending = keep;
            ready
        };
        if ready.is_empty() {
            return;
        }

        let count = ready.len();
        for pending in ready {
            // The map reference was the last one; shed the tensor before
            // the handle itself goes.
            match Arc::try_unwrap(pending.sim) {
                Ok(mut sim) => {
                    sim.wind_mut().shed();
                    drop(sim);
                }
                Err(arc) => {
                    warn!("simulator still referenced at teardown; dropping our handle");
                    drop(arc);
                }
            }
            self.disk.unpin(&pending.artifact);
        }
        debug!("tore down {} simulators", count);
        metrics::counter!("simulator_cache.teardowns").increment(count as u64);
        allocator_release();
    }

    /// Time since the last `acquire`, for the reaper's idle detection.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

fn effective_mode(inner: &Inner) -> CacheMode {
    if inner.mode == CacheMode::Ensemble && Instant::now() < inner.mode_deadline {
        CacheMode::Ensemble
    } else {
        CacheMode::Normal
    }
}

fn capacity_of(inner: &Inner, k_norm: usize, k_ens: usize) -> usize {
    match effective_mode(inner) {
        CacheMode::Ensemble => k_ens,
        CacheMode::Normal => k_norm,
    }
}

/// Best-effort hint to jemalloc to return dirty pages to the OS.
#[cfg(not(target_env = "msvc"))]
fn allocator_release() {
    let _ = tikv_jemalloc_ctl::epoch::advance();
    // MALLCTL_ARENAS_ALL == 4096
    unsafe {
        let _ = tikv_jemalloc_ctl::raw::write(b"arena.4096.purge\0", ());
    }
}

#[cfg(target_env = "msvc")]
fn allocator_release() {}

/// A pinned reference to a cached simulator. Dropping it releases the pin;
/// entries evicted while leased are torn down after the last lease drops.
pub struct SimulatorLease {
    cache: Arc<SimulatorCache>,
    key: Key,
    id: u64,
    sim: Arc<Simulator>,
}

impl SimulatorLease {
    pub fn cycle(&self) -> &CycleId {
        self.sim.cycle()
    }
}

impl Deref for SimulatorLease {
    type Target = Simulator;

    fn deref(&self) -> &Simulator {
        &self.sim
    }
}

impl Drop for SimulatorLease {
    fn drop(&mut self) {
        self.cache.release(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::{ArtifactStore, DirStore};
    use crate::wind::{WindHeader, write_artifact};
    use std::str::FromStr;
    use tempfile::TempDir;

    const CYCLE_A: &str = "2024010100";
    const CYCLE_B: &str = "2024010106";

    fn seed_member(remote: &std::path::Path, cycle: &str, member: u8) {
        let header = WindHeader {
            n_t: 2,
            n_p: 2,
            n_lat: 5,
            n_lon: 8,
            dt_secs: 3600,
            base: 1_700_000_000,
            levels: vec![1000.0, 10.0],
        };
        let values = vec![1.0f32; header.values()];
        write_artifact(
            &remote.join(format!("{}_{:02}.zst", cycle, member)),
            &header,
            &values,
        )
        .unwrap();
    }

    fn stack(
        k_norm: usize,
        k_ens: usize,
    ) -> (TempDir, TempDir, Arc<SimulatorCache>, Arc<CycleState>) {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();

        for member in 0..6 {
            seed_member(remote.path(), CYCLE_A, member);
            seed_member(remote.path(), CYCLE_B, member);
        }
        let elev_path = remote.path().join("elev.bin");
        crate::elevation::write_grid(&elev_path, 19, |_, _| 0).unwrap();

        let store = Arc::new(ArtifactStore::new(Arc::new(DirStore::new(remote.path()))));
        let disk = Arc::new(DiskCache::new(local.path().join("cache"), store, 32).unwrap());
        let elevation = Arc::new(ElevationGrid::open(&elev_path).unwrap());

        let state = Arc::new(CycleState::new());
        state.flip_to(CycleId::from_str(CYCLE_A).unwrap());

        let cache =
            SimulatorCache::with_capacities(disk, elevation, state.clone(), k_norm, k_ens);
        (remote, local, cache, state)
    }

    #[tokio::test]
    async fn acquire_builds_and_reuses() {
        let (_r, _l, cache, _state) = stack(4, 8);

        let lease = cache.acquire(0).await.unwrap();
        assert_eq!(lease.member(), 0);
        assert_eq!(lease.cycle().to_string(), CYCLE_A);
        drop(lease);

        let _again = cache.acquire(0).await.unwrap();
        assert_eq!(cache.live_count(), 1);
    }

    #[tokio::test]
    async fn missing_member_artifact_surfaces() {
        let (_r, _l, cache, _state) = stack(4, 8);
        assert!(matches!(
            cache.acquire(19).await,
            Err(SimError::ArtifactMissing(_))
        ));
    }

    #[tokio::test]
    async fn lru_eviction_respects_leases() {
        let (_r, _l, cache, _state) = stack(2, 8);

        let hold = cache.acquire(0).await.unwrap();
        let b = cache.acquire(1).await.unwrap();
        drop(b);
        let _c = cache.acquire(2).await.unwrap();

        // member 1 (unleased LRU) was evicted, member 0 is pinned by the lease
        assert_eq!(cache.live_count(), 2);
        let l0 = cache.acquire(0).await.unwrap();
        assert_eq!(cache.live_count(), 2);
        drop(l0);
        drop(hold);
    }

    #[tokio::test]
    async fn foreign_entries_never_returned_after_flip() {
        let (_r, _l, cache, state) = stack(4, 8);

        let old = cache.acquire(0).await.unwrap();
        assert_eq!(old.cycle().to_string(), CYCLE_A);

        state.flip_to(CycleId::from_str(CYCLE_B).unwrap());
        cache.invalidate_foreign(&CycleId::from_str(CYCLE_B).unwrap());

        let fresh = cache.acquire(0).await.unwrap();
        assert_eq!(fresh.cycle().to_string(), CYCLE_B);

        // The old lease still works against its own cycle until dropped.
        assert_eq!(old.cycle().to_string(), CYCLE_A);
        drop(old);
        drop(fresh);

        tokio::time::sleep(QUIESCENCE + Duration::from_millis(50)).await;
        cache.reclaim();
        assert_eq!(cache.pending_count(), 0);
    }

    #[tokio::test]
    async fn ensemble_mode_raises_capacity_then_expires() {
        let (_r, _l, cache, _state) = stack(2, 5);

        cache.set_mode(CacheMode::Ensemble, Duration::from_millis(300));
        assert_eq!(cache.access_mode(), AccessMode::Resident);

        for member in 0..4 {
            let lease = cache.acquire(member).await.unwrap();
            drop(lease);
        }
        assert_eq!(cache.live_count(), 4);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cache.mode(), CacheMode::Normal);
        cache.trim();
        assert_eq!(cache.live_count(), 2);
    }

    #[tokio::test]
    async fn reclaim_waits_for_quiescence() {
        let (_r, _l, cache, _state) = stack(1, 8);

        let a = cache.acquire(0).await.unwrap();
        drop(a);
        let b = cache.acquire(1).await.unwrap();
        drop(b);

        // member 0 evicted into pending; too fresh to tear down
        assert_eq!(cache.pending_count(), 1);
        cache.reclaim();
        assert_eq!(cache.pending_count(), 1);

        tokio::time::sleep(QUIESCENCE + Duration::from_millis(50)).await;
        cache.reclaim();
        assert_eq!(cache.pending_count(), 0);
    }
}
