use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Number of GEFS ensemble members, control included.
pub const ENSEMBLE_MEMBERS: u8 = 21;

/// Runtime configuration, read once at startup from the environment.
///
/// Recognized variables:
/// - `HABSIM_BUCKET_URL` - base URL of the object store bucket holding the
///   wind, elevation, and cycle-pointer artifacts. A plain filesystem path
///   selects the local-directory backend.
/// - `HABSIM_STORE_TOKEN` - optional bearer token attached to store requests.
/// - `HABSIM_CACHE_DIR` - local state directory (disk cache, cycle pointer,
///   progress mirror). Defaults to `/var/habsim`.
/// - `HABSIM_ENSEMBLE_PASSWORD` - optional password gating ensemble requests.
/// - `HABSIM_ENSEMBLE_TTL_SECS` - how long ensemble cache mode lingers after
///   the last ensemble activity. Default 60.
/// - `HABSIM_WORKERS` - cap on concurrent simulation units. Default
///   min(32, cores).
/// - `PORT` - HTTP listen port. Default 5000.
#[derive(Debug, Clone)]
pub struct Config {
    pub bucket_url: String,
    pub store_token: Option<String>,
    pub cache_dir: PathBuf,
    pub ensemble_password: Option<String>,
    pub ensemble_ttl: Duration,
    pub workers: usize,
    pub port: u16,
    /// Uniform per-request deadline.
    pub request_deadline: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bucket_url = env::var("HABSIM_BUCKET_URL")
            .map_err(|_| anyhow::anyhow!("HABSIM_BUCKET_URL must be set"))?;

        let cache_dir =
            PathBuf::from(env::var("HABSIM_CACHE_DIR").unwrap_or_else(|_| "/var/habsim".into()));

        let ensemble_ttl = env::var("HABSIM_ENSEMBLE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        let workers = env::var("HABSIM_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_workers);

        let port = env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(5000);

        Ok(Self {
            bucket_url,
            store_token: env::var("HABSIM_STORE_TOKEN").ok(),
            cache_dir,
            ensemble_password: env::var("HABSIM_ENSEMBLE_PASSWORD").ok(),
            ensemble_ttl,
            workers,
            port,
            request_deadline: Duration::from_secs(15 * 60),
        })
    }

    pub fn disk_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("cache")
    }

    pub fn cycle_pointer_path(&self) -> PathBuf {
        self.cache_dir.join("active_cycle")
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.cache_dir.join("progress")
    }
}

/// One simulation unit per core, capped at 32 as the wind-field sampling
/// becomes memory-bandwidth bound beyond that.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(32)
}
