use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::artifact_store::ArtifactStore;
use crate::cycle::CycleId;
use crate::errors::StoreError;
use crate::wind::decompressed_path;

/// Name of the pinned global elevation artifact. It is cycle-independent
/// and never evicted once present.
pub const ELEVATION_ARTIFACT: &str = "worldelev.bin";

/// Local-disk LRU of wind artifacts plus the pinned elevation grid.
///
/// Concurrent callers asking for the same artifact share one download
/// (per-artifact `Notify`, waiters block until the downloader finishes).
/// Writes are atomic: a temp file in the cache directory renamed into
/// place, so a consumer never observes a partial artifact. Eviction runs
/// before a new download when the wind-file count would exceed capacity,
/// and skips the elevation artifact, anything still downloading, and
/// anything pinned open by a live simulator.
pub struct DiskCache {
    dir: PathBuf,
    store: Arc<ArtifactStore>,
    capacity: usize,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
    last_access: StdMutex<HashMap<String, Instant>>,
    pins: StdMutex<HashMap<String, usize>>,
}

impl DiskCache {
    pub fn new(dir: PathBuf, store: Arc<ArtifactStore>, capacity: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            store,
            capacity,
            in_flight: Mutex::new(HashMap::new()),
            last_access: StdMutex::new(HashMap::new()),
            pins: StdMutex::new(HashMap::new()),
        })
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Ensure an artifact is present locally, downloading it if necessary.
    /// Only one download happens per artifact under concurrency; the rest
    /// wait and re-check.
    pub async fn ensure(&self, name: &str) -> Result<PathBuf, StoreError> {
        let path = self.path_of(name);

        if path.exists() {
            self.touch(name);
            metrics::counter!("disk_cache.hits").increment(1);
            return Ok(path);
        }
        metrics::counter!("disk_cache.misses").increment(1);

        // First caller downloads, the rest wait on the artifact's Notify.
        let (should_download, notify) = {
            let mut map = self.in_flight.lock().await;
            if let Some(existing) = map.get(name) {
                (false, existing.clone())
            } else {
                let notify = Arc::new(Notify::new());
                map.insert(name.to_string(), notify.clone());
                (true, notify)
            }
        };

        if should_download {
            // Make room before the new artifact lands, not after.
            if name != ELEVATION_ARTIFACT {
                self.evict_for(1).await;
            }

            let result = self.download(name, &path).await;

            notify.notify_waiters();
            self.in_flight.lock().await.remove(name);

            result?;
            self.touch(name);
            Ok(path)
        } else {
            notify.notified().await;
            if path.exists() {
                self.touch(name);
                Ok(path)
            } else {
                // The downloader failed; surface a retryable error.
                Err(StoreError::Io(std::io::Error::other(format!(
                    "download of {} did not materialize",
                    name
                ))))
            }
        }
    }

    async fn download(&self, name: &str, path: &Path) -> Result<(), StoreError> {
        debug!("downloading artifact {}", name);
        let tmp = self.dir.join(format!(".{}.dl", name));
        match self.store.get_blob(name, &tmp).await {
            Ok(()) => {
                std::fs::rename(&tmp, path)?;
                metrics::counter!("disk_cache.downloads").increment(1);
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                Err(err)
            }
        }
    }

    fn touch(&self, name: &str) {
        self.last_access
            .lock()
            .unwrap()
            .insert(name.to_string(), Instant::now());
    }

    /// Pin an artifact open (a live simulator maps it). Pinned artifacts
    /// survive eviction and cycle flips until unpinned.
    pub fn pin(&self, name: &str) {
        *self.pins.lock().unwrap().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn unpin(&self, name: &str) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(count) = pins.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                pins.remove(name);
            }
        }
    }

    fn is_pinned(&self, name: &str) -> bool {
        self.pins.lock().unwrap().contains_key(name)
    }

    /// Drop a cached artifact and its decompressed sibling. Used for the
    /// one cache-bust retry after a simulator build failure.
    pub fn bust(&self, name: &str) {
        let path = self.path_of(name);
        let _ = std::fs::remove_file(decompressed_path(&path));
        let _ = std::fs::remove_file(&path);
        self.last_access.lock().unwrap().remove(name);
    }

    /// Wind artifacts currently on disk. Skips the elevation artifact,
    /// decompressed siblings, and temp files.
    fn wind_files(&self) -> Vec<(String, SystemTime)> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == ELEVATION_ARTIFACT || !name.ends_with(".zst") {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((name, mtime));
        }
        out
    }

    pub fn wind_file_count(&self) -> usize {
        self.wind_files().len()
    }

    /// Evict least-recently-used wind artifacts until `need` more fit
    /// within capacity. Pinned and in-flight artifacts are skipped.
    async fn evict_for(&self, need: usize) {
        let files = self.wind_files();
        if files.len() + need <= self.capacity {
            return;
        }
        let mut excess = files.len() + need - self.capacity;

        let in_flight: Vec<String> = self.in_flight.lock().await.keys().cloned().collect();
        let access = self.last_access.lock().unwrap().clone();

        // LRU order: artifacts we have never served first (by mtime), then
        // by last access.
        let mut candidates: Vec<(String, Option<Instant>, SystemTime)> = files
            .into_iter()
            .map(|(name, mtime)| {
                let last = access.get(&name).copied();
                (name, last, mtime)
            })
            .collect();
        candidates.sort_by(|a, b| match (a.1, b.1) {
            (None, None) => a.2.cmp(&b.2),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        });

        for (name, _, _) in candidates {
            if excess == 0 {
                break;
            }
            if self.is_pinned(&name) || in_flight.contains(&name) {
                continue;
            }
            self.remove(&name);
            excess -= 1;
        }
        if excess > 0 {
            warn!("disk cache over capacity but all artifacts pinned or downloading");
        }
    }

    fn remove(&self, name: &str) {
        debug!("evicting artifact {}", name);
        let path = self.path_of(name);
        let _ = std::fs::remove_file(decompressed_path(&path));
        if std::fs::remove_file(&path).is_ok() {
            metrics::counter!("disk_cache.evictions").increment(1);
        }
        self.last_access.lock().unwrap().remove(name);
    }

    /// Lazily delete wind artifacts that do not belong to `cycle`. Pinned
    /// and in-flight artifacts survive until their simulator is destroyed.
    pub async fn evict_except_active(&self, cycle: &CycleId) {
        let prefix = format!("{}_", cycle);
        let in_flight: Vec<String> = self.in_flight.lock().await.keys().cloned().collect();

        let mut removed = 0usize;
        for (name, _) in self.wind_files() {
            if name.starts_with(&prefix) {
                continue;
            }
            if self.is_pinned(&name) || in_flight.contains(&name) {
                continue;
            }
            self.remove(&name);
            removed += 1;
        }
        if removed > 0 {
            info!("evicted {} artifacts from cycles other than {}", removed, cycle);
        }
    }
}
