use std::time::Duration;
use tracing::info;

/// Throttle policy for progress propagation through the reconciliation
/// bridge: propagate on terminal status and on the first nonzero progress,
/// otherwise only when the visual delta or the heartbeat interval is hit.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Minimum visual delta (in percentage points) worth propagating.
    pub min_progress_delta: f64,
    /// Heartbeat: propagate anyway after this long, so long chunked phases
    /// keep the progress indicator visibly alive.
    pub heartbeat: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        ReconcilePolicy {
            min_progress_delta: 0.5,
            heartbeat: Duration::from_millis(750),
        }
    }
}

/// Polling policy for the backend stability check.
///
/// Bounded on purpose: after `max_attempts` polls (with exponential backoff
/// capped at `max_interval`) the session is marked stuck instead of polling
/// forever.
#[derive(Debug, Clone)]
pub struct StabilityPolicy {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        StabilityPolicy {
            interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(8),
            max_attempts: 30,
        }
    }
}

/// Engine configuration.
/// In debug builds `load()` also picks up a local `.env` file.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Files at or above this size use the chunked strategy.
    pub chunk_threshold: u64,
    /// Part size for chunked transfers.
    pub chunk_size: u64,
    /// Transfer concurrency budget. Sequential by policy, but the scheduler
    /// generalizes to any N.
    pub max_concurrent: usize,
    pub reconcile: ReconcilePolicy,
    pub stability: StabilityPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_threshold: 5 * 1024 * 1024,
            chunk_size: 5 * 1024 * 1024,
            max_concurrent: 1,
            reconcile: ReconcilePolicy::default(),
            stability: StabilityPolicy::default(),
        }
    }
}

impl UploadConfig {
    /// Load configuration: defaults, overridden by environment variables.
    pub fn load() -> Self {
        #[cfg(debug_assertions)]
        if dotenvy::dotenv().is_ok() {
            info!("Config: loaded .env file");
        }

        Self::from_env()
    }

    fn from_env() -> Self {
        let mut config = UploadConfig::default();

        if let Some(v) = env_u64("STOWER_CHUNK_THRESHOLD") {
            config.chunk_threshold = v;
        }
        if let Some(v) = env_u64("STOWER_CHUNK_SIZE") {
            config.chunk_size = v.max(1);
        }
        if let Some(v) = env_u64("STOWER_MAX_CONCURRENT") {
            config.max_concurrent = (v as usize).max(1);
        }
        if let Some(v) = env_u64("STOWER_STABILITY_INTERVAL_MS") {
            config.stability.interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("STOWER_STABILITY_MAX_ATTEMPTS") {
            config.stability.max_attempts = v as u32;
        }

        info!(
            "Config: chunk_threshold={} chunk_size={} max_concurrent={}",
            config.chunk_threshold, config.chunk_size, config.max_concurrent
        );

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
