use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Terminal entries linger this long for late subscribers before reaping.
const LINGER_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Complete,
    Cancelled,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        self != ProgressStatus::Running
    }
}

/// Progress of one ensemble request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub done: u32,
    pub done_ensemble: u32,
    pub done_monte_carlo: u32,
    pub status: ProgressStatus,
    /// Epoch seconds of the last update.
    pub updated_at: i64,
}

impl Progress {
    pub fn percentage(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.done * 100) / self.total
    }
}

/// Multi-reader progress state keyed by request fingerprint.
///
/// The owning worker updates the fast in-process map; every update is
/// mirrored to one JSON file per request under a shared directory so peer
/// workers can serve progress reads for requests they do not own. Entries
/// are reaped 30 s after reaching a terminal status.
pub struct ProgressStore {
    map: DashMap<String, Progress>,
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            map: DashMap::new(),
            dir,
        })
    }

    /// Register a fresh request with `total` expected units.
    pub fn start(&self, request_id: &str, total: u32) {
        let progress = Progress {
            total,
            done: 0,
            done_ensemble: 0,
            done_monte_carlo: 0,
            status: ProgressStatus::Running,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.map.insert(request_id.to_string(), progress.clone());
        self.mirror(request_id, &progress);
    }

    /// Apply an update to a request's entry and mirror it for peers.
    pub fn update(&self, request_id: &str, apply: impl FnOnce(&mut Progress)) {
        let Some(mut entry) = self.map.get_mut(request_id) else {
            return;
        };
        apply(&mut entry);
        entry.updated_at = chrono::Utc::now().timestamp();
        let snapshot = entry.clone();
        drop(entry);
        self.mirror(request_id, &snapshot);
    }

    /// Move a request to a terminal status.
    pub fn finish(&self, request_id: &str, status: ProgressStatus) {
        self.update(request_id, |p| p.status = status);
    }

    /// Read progress, falling back to the mirror directory for requests
    /// owned by a peer worker.
    pub fn read(&self, request_id: &str) -> Option<Progress> {
        if let Some(entry) = self.map.get(request_id) {
            return Some(entry.clone());
        }
        let bytes = std::fs::read(self.mirror_path(request_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Reap terminal entries whose linger window has passed, both from the
    /// in-process map and the mirror directory.
    pub fn reap(&self) {
        let now = chrono::Utc::now().timestamp();
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|e| e.status.is_terminal() && now - e.updated_at > LINGER_SECS)
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.map.remove(id);
            let _ = std::fs::remove_file(self.mirror_path(id));
            debug!("reaped progress entry {}", id);
        }

        // Mirror files left behind by dead peers.
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                let Some(progress) = std::fs::read(&path)
                    .ok()
                    .and_then(|b| serde_json::from_slice::<Progress>(&b).ok())
                else {
                    continue;
                };
                if progress.status.is_terminal() && now - progress.updated_at > LINGER_SECS {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    fn mirror_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", request_id))
    }

    fn mirror(&self, request_id: &str, progress: &Progress) {
        let path = self.mirror_path(request_id);
        let tmp = self.dir.join(format!(".{}.tmp", request_id));
        let write = || -> std::io::Result<()> {
            std::fs::write(&tmp, serde_json::to_vec(progress)?)?;
            std::fs::rename(&tmp, &path)
        };
        if let Err(err) = write() {
            warn!("failed to mirror progress for {}: {}", request_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path().join("progress")).unwrap();
        (dir, store)
    }

    #[test]
    fn start_update_read_roundtrip() {
        let (_d, store) = store();
        store.start("abc123", 441);
        store.update("abc123", |p| {
            p.done = 10;
            p.done_ensemble = 2;
            p.done_monte_carlo = 8;
        });

        let progress = store.read("abc123").unwrap();
        assert_eq!(progress.done, 10);
        assert_eq!(progress.percentage(), 2);
        assert_eq!(progress.status, ProgressStatus::Running);
    }

    #[test]
    fn peers_read_through_the_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let owner = ProgressStore::new(dir.path().join("progress")).unwrap();
        let peer = ProgressStore::new(dir.path().join("progress")).unwrap();

        owner.start("abc123", 100);
        owner.update("abc123", |p| p.done = 50);

        let seen = peer.read("abc123").unwrap();
        assert_eq!(seen.done, 50);
    }

    #[test]
    fn terminal_entries_linger_then_reap() {
        let (_d, store) = store();
        store.start("abc123", 10);
        store.finish("abc123", ProgressStatus::Complete);

        // Within the linger window it stays readable.
        store.reap();
        assert!(store.read("abc123").is_some());

        // Age the entry past the window (directly, since update() stamps
        // updated_at) and reap again.
        store
            .map
            .get_mut("abc123")
            .map(|mut e| e.updated_at = chrono::Utc::now().timestamp() - LINGER_SECS - 5);
        store.reap();
        assert!(store.read("abc123").is_none());
    }

    #[test]
    fn running_entries_are_not_reaped() {
        let (_d, store) = store();
        store.start("abc123", 10);
        store
            .map
            .get_mut("abc123")
            .map(|mut e| e.updated_at = chrono::Utc::now().timestamp() - 3600);
        store.reap();
        assert!(store.read("abc123").is_some());
    }
}
