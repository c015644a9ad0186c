//! Service settings read from `CHARTFLEET_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::MANAGEMENT_CLUSTER_NAME;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub cache_dir: PathBuf,
    pub management_cluster: String,
    pub job_ttl: Duration,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    pub watch_backoff_base: Duration,
    pub watch_backoff_max: Duration,
    pub fleet_queue_cap: usize,
    pub metrics_addr: Option<String>,
    /// How the management cluster reaches source-controller artifacts.
    pub management_fetch: ArtifactFetchMode,
    /// `host[:port]` that replaces the artifact URL host on direct fetches.
    pub source_controller_host: Option<String>,
}

/// Artifact transport for the management cluster. Leaf clusters always
/// go through the API-server service proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactFetchMode {
    #[default]
    Proxy,
    /// Plain HTTP GET, for when chartfleet runs inside the management cluster.
    Direct,
}

impl std::str::FromStr for ArtifactFetchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(Self::Proxy),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown artifact fetch mode {:?}, expected proxy or direct", other)),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            management_cluster: MANAGEMENT_CLUSTER_NAME.to_string(),
            job_ttl: Duration::from_secs(3600),
            ready_poll_interval: Duration::from_millis(1000),
            ready_timeout: Duration::from_secs(10),
            watch_backoff_base: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
            fleet_queue_cap: 64,
            metrics_addr: None,
            management_fetch: ArtifactFetchMode::Proxy,
            source_controller_host: None,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(".")).join(".chartfleet")
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            cache_dir: std::env::var("CHARTFLEET_CACHE_DIR").map(PathBuf::from).unwrap_or(d.cache_dir),
            management_cluster: std::env::var("CHARTFLEET_MANAGEMENT_CLUSTER").ok().filter(|s| !s.is_empty()).unwrap_or(d.management_cluster),
            job_ttl: env_u64("CHARTFLEET_JOB_TTL_SECS").map(Duration::from_secs).unwrap_or(d.job_ttl),
            ready_poll_interval: env_u64("CHARTFLEET_READY_POLL_MS").filter(|v| *v > 0).map(Duration::from_millis).unwrap_or(d.ready_poll_interval),
            ready_timeout: env_u64("CHARTFLEET_READY_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.ready_timeout),
            watch_backoff_base: env_u64("CHARTFLEET_WATCH_BACKOFF_BASE_MS").filter(|v| *v > 0).map(Duration::from_millis).unwrap_or(d.watch_backoff_base),
            watch_backoff_max: env_u64("CHARTFLEET_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
            fleet_queue_cap: env_u64("CHARTFLEET_FLEET_QUEUE_CAP").map(|v| v.max(1) as usize).unwrap_or(d.fleet_queue_cap),
            metrics_addr: std::env::var("CHARTFLEET_METRICS_ADDR").ok().filter(|s| !s.is_empty()),
            management_fetch: std::env::var("CHARTFLEET_MANAGEMENT_FETCH").ok().and_then(|s| s.parse().ok()).unwrap_or(d.management_fetch),
            source_controller_host: std::env::var("SOURCE_CONTROLLER_LOCALHOST").ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        }
    }

    /// Path of the chart cache database.
    pub fn database_path(&self) -> PathBuf {
        self.cache_dir.join("charts.db")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { base: self.watch_backoff_base, max: self.watch_backoff_max }
    }
}

/// Exponential backoff for reconcile retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        ServiceConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (0-based), doubling up to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}
