use anyhow::{Context, Result, bail};
use futures_util::StreamExt;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::artifact_store::ArtifactStore;
use crate::disk_cache::DiskCache;
use crate::errors::{SimError, StoreError};
use crate::prediction_cache::PredictionCache;
use crate::simulator_cache::SimulatorCache;

/// Remote pointer artifact naming the newest complete-or-uploading cycle.
pub const ACTIVE_CYCLE_ARTIFACT: &str = "active_cycle";

/// Guard interval between the completeness check and the flip, letting
/// just-finished uploads settle on the store before we re-verify.
const DEFAULT_GUARD_INTERVAL: Duration = Duration::from_secs(2);

/// How long `await_stable` polls a pending cycle before giving up.
const STABLE_POLL_BUDGET: Duration = Duration::from_secs(30);

const STABLE_INTERVAL: Duration = Duration::from_millis(250);

/// A GEFS run identifier: the opaque fixed-width token `YYYYMMDDHH`.
/// Two artifacts belong to the same cycle iff their tokens match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleId(String);

impl CycleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote name of one member's wind artifact.
    pub fn wind_artifact(&self, member: u8) -> String {
        format!("{}_{:02}.zst", self.0, member)
    }
}

impl FromStr for CycleId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
            bail!("cycle token {:?} is not 10 digits", s);
        }
        let year: i32 = s[0..4].parse()?;
        let month: u32 = s[4..6].parse()?;
        let day: u32 = s[6..8].parse()?;
        let hour: u32 = s[8..10].parse()?;
        if chrono::NaiveDate::from_ymd_opt(year, month, day).is_none() || hour > 23 {
            bail!("cycle token {:?} is not a valid timestamp", s);
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The in-process view of the active cycle. The `epoch` is a monotonic
/// cache-consistency token bumped on every flip; the pointer file on disk,
/// not this struct, is the cross-process source of truth.
pub struct CycleState {
    inner: RwLock<(Option<CycleId>, u64)>,
}

impl CycleState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new((None, 0)),
        }
    }

    pub fn active(&self) -> Option<(CycleId, u64)> {
        let inner = self.inner.read().unwrap();
        inner.0.clone().map(|c| (c, inner.1))
    }

    pub fn observe(&self) -> (Option<CycleId>, u64) {
        let inner = self.inner.read().unwrap();
        (inner.0.clone(), inner.1)
    }

    pub fn flip_to(&self, cycle: CycleId) {
        let mut inner = self.inner.write().unwrap();
        inner.0 = Some(cycle);
        inner.1 += 1;
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one `refresh` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    /// Remote pointer matches the active cycle.
    Current,
    /// A new cycle was adopted; caches were invalidated.
    Flipped(CycleId),
    /// The remote pointer names a cycle whose artifacts are not all
    /// uploaded yet. No state was mutated.
    Pending(CycleId),
}

/// Advisory flock serializing flips across worker processes. The lock
/// lives on a stable `.lock` sibling, never on the pointer file itself:
/// the pointer is atomically replaced by rename, which would detach any
/// lock held on its inode.
struct PointerLock {
    file: std::fs::File,
}

impl PointerLock {
    fn acquire(pointer_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = pointer_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path = pointer_path.with_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open cycle pointer lock {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error())
                    .context("flock on cycle pointer file");
            }
        }

        Ok(Self { file })
    }
}

impl Drop for PointerLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Detects cycle flips, validates completeness, and atomically swings the
/// active cycle, invalidating every cache tagged with the old one.
///
/// State machine: Absent -> Pending -> Active -> (Pending' -> Active'),
/// where Active -> Active' happens only through the locked, re-verified
/// flip in `refresh`.
pub struct CycleManager {
    store: Arc<ArtifactStore>,
    state: Arc<CycleState>,
    pointer_path: PathBuf,
    sim_cache: Arc<SimulatorCache>,
    predictions: PredictionCache,
    disk: Arc<DiskCache>,
    pending: StdMutex<Option<CycleId>>,
    /// Serializes concurrent refresh calls within this process; the flock
    /// serializes across processes.
    refresh_lock: tokio::sync::Mutex<()>,
    members: u8,
    guard_interval: Duration,
}

impl CycleManager {
    pub fn new(
        store: Arc<ArtifactStore>,
        state: Arc<CycleState>,
        pointer_path: PathBuf,
        sim_cache: Arc<SimulatorCache>,
        predictions: PredictionCache,
        disk: Arc<DiskCache>,
        members: u8,
    ) -> Self {
        let manager = Self {
            store,
            state,
            pointer_path,
            sim_cache,
            predictions,
            disk,
            pending: StdMutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            members,
            guard_interval: DEFAULT_GUARD_INTERVAL,
        };

        // Adopt a pointer persisted by an earlier run or a peer worker;
        // the next refresh re-validates it against the store.
        if let Ok(text) = std::fs::read_to_string(&manager.pointer_path)
            && let Ok(cycle) = CycleId::from_str(&text)
        {
            info!("adopting persisted active cycle {}", cycle);
            manager.state.flip_to(cycle);
        }
        manager
    }

    /// Shorten the settle window between completeness checks. The default
    /// suits production upload cadence; test stores settle instantly.
    pub fn set_guard_interval(&mut self, guard: Duration) {
        self.guard_interval = guard;
    }

    pub fn state(&self) -> &Arc<CycleState> {
        &self.state
    }

    /// The active `(cycle, epoch)`, or `CycleUnavailable` before the first
    /// successful refresh.
    pub fn active(&self) -> Result<(CycleId, u64), SimError> {
        self.state.active().ok_or(SimError::CycleUnavailable)
    }

    /// Compare the remote pointer against the active cycle and flip if a
    /// new, complete cycle is available.
    pub async fn refresh(&self) -> Result<Refresh> {
        let _serial = self.refresh_lock.lock().await;

        let text = self.store.get_text(ACTIVE_CYCLE_ARTIFACT).await?;
        let remote = CycleId::from_str(&text)
            .with_context(|| format!("remote cycle pointer {:?}", text.trim()))?;

        if self.state.active().map(|(c, _)| c).as_ref() == Some(&remote) {
            *self.pending.lock().unwrap() = None;
            return Ok(Refresh::Current);
        }

        if !self.is_complete(&remote).await? {
            debug!("cycle {} advertised but not yet complete", remote);
            *self.pending.lock().unwrap() = Some(remote.clone());
            return Ok(Refresh::Pending(remote));
        }

        // Serialize the flip across processes, then let just-finished
        // uploads settle and re-verify before committing.
        let lock_path = self.pointer_path.clone();
        let _lock = tokio::task::spawn_blocking(move || PointerLock::acquire(&lock_path))
            .await
            .context("pointer lock task")??;

        tokio::time::sleep(self.guard_interval).await;
        if !self.is_complete(&remote).await? {
            warn!("cycle {} lost completeness during guard interval", remote);
            *self.pending.lock().unwrap() = Some(remote.clone());
            return Ok(Refresh::Pending(remote));
        }

        self.commit_flip(&remote)?;
        *self.pending.lock().unwrap() = None;

        // Artifacts of older cycles are deleted lazily off the request path.
        let disk = self.disk.clone();
        let adopted = remote.clone();
        tokio::spawn(async move {
            disk.evict_except_active(&adopted).await;
        });

        Ok(Refresh::Flipped(remote))
    }

    /// A cycle is complete when every member artifact answers a HEAD probe.
    async fn is_complete(&self, cycle: &CycleId) -> Result<bool> {
        let probes = futures_util::stream::iter(0..self.members)
            .map(|member| {
                let name = cycle.wind_artifact(member);
                async move { self.store.head(&name).await }
            })
            .buffer_unordered(8)
            .collect::<Vec<_>>()
            .await;

        for probe in probes {
            match probe {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(other) => return Err(other).context("completeness probe"),
            }
        }
        Ok(true)
    }

    /// Atomically rewrite the pointer file, bump the epoch, and invalidate
    /// every cache entry tagged with the prior cycle.
    fn commit_flip(&self, cycle: &CycleId) -> Result<()> {
        let tmp = self.pointer_path.with_extension("tmp");
        std::fs::write(&tmp, cycle.as_str())?;
        std::fs::rename(&tmp, &self.pointer_path)?;

        self.state.flip_to(cycle.clone());
        self.sim_cache.invalidate_foreign(cycle);
        self.predictions.clear();

        let (_, epoch) = self.state.active().expect("just flipped");
        info!("active cycle is now {} (epoch {})", cycle, epoch);
        metrics::counter!("cycle.flips").increment(1);
        Ok(())
    }

    /// Wait for two consecutive identical `(cycle, epoch)` observations.
    /// While the last refresh reported a pending cycle, keep polling the
    /// store within a bounded budget before failing `CycleUnavailable`.
    pub async fn await_stable(&self) -> Result<(CycleId, u64), SimError> {
        let deadline = tokio::time::Instant::now() + STABLE_POLL_BUDGET;
        loop {
            let first = self.state.observe();
            tokio::time::sleep(STABLE_INTERVAL).await;
            let second = self.state.observe();

            let pending = self.pending.lock().unwrap().clone();
            if first == second
                && pending.is_none()
                && let (Some(cycle), epoch) = second
            {
                return Ok((cycle, epoch));
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SimError::CycleUnavailable);
            }

            if pending.is_some() {
                // The uploader may have finished another member by now.
                if let Err(err) = self.refresh().await {
                    warn!("refresh while awaiting stability failed: {err:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_id_accepts_valid_tokens() {
        for token in ["2024010100", "2023123118", "2024022912"] {
            assert!(CycleId::from_str(token).is_ok(), "{token}");
        }
    }

    #[test]
    fn cycle_id_rejects_bad_tokens() {
        for token in ["2024010", "20240101000", "2024013100x", "2024134500", "2023022912"] {
            assert!(CycleId::from_str(token).is_err(), "{token}");
        }
        // hour out of range
        assert!(CycleId::from_str("2024010124").is_err());
    }

    #[test]
    fn cycle_id_orders_chronologically() {
        let a = CycleId::from_str("2024010100").unwrap();
        let b = CycleId::from_str("2024010106").unwrap();
        assert!(a < b);
    }

    #[test]
    fn wind_artifact_names_are_zero_padded() {
        let cycle = CycleId::from_str("2024010100").unwrap();
        assert_eq!(cycle.wind_artifact(0), "2024010100_00.zst");
        assert_eq!(cycle.wind_artifact(20), "2024010100_20.zst");
    }

    #[test]
    fn state_flip_bumps_epoch() {
        let state = CycleState::new();
        assert!(state.active().is_none());

        state.flip_to(CycleId::from_str("2024010100").unwrap());
        let (cycle, epoch) = state.active().unwrap();
        assert_eq!(cycle.as_str(), "2024010100");
        assert_eq!(epoch, 1);

        state.flip_to(CycleId::from_str("2024010106").unwrap());
        let (_, epoch) = state.active().unwrap();
        assert_eq!(epoch, 2);
    }
}
