//! Engine configuration. Grounded on the teacher's convention of a typed
//! config struct with a spec-documented `Default` (see e.g. the defaults
//! baked into `cloud_provider` chart values) rather than a stringly-typed
//! map; the actual TOML/env loading layer is conventional plumbing left to
//! a binary crate that embeds this one. Duration fields accept the
//! teacher's human-readable strings ("30s", "5m") via `duration_str` on
//! deserialize, so an operator-facing config file never carries raw
//! nanosecond counts.

use std::collections::HashMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tenants feature-flagged onto the convergence engine. Empty means no
    /// tenant is enabled — a safe default that cannot out-of-the-box start
    /// mutating a fleet.
    pub convergence_tenants: Vec<String>,
    pub worker: WorkerConfig,
    pub region_overrides: HashMap<String, Url>,
    pub create_server: CreateServerConfig,
    pub step_parallelism: usize,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub delete_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub cycle_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub lock_acquire_timeout: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub lock_release_timeout: Duration,
    pub converger_poll_interval_range: (Duration, Duration),
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub http_call_deadline: Duration,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub lb_max_retries: u32,
    pub lb_retry_interval_range: (Duration, Duration),
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            lb_max_retries: 12,
            lb_retry_interval_range: (Duration::from_secs(5), Duration::from_secs(7)),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CreateServerConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Global cap on concurrent CreateServer calls across the whole
    /// process, per spec.md §5 ("Rate-limiting").
    pub global_concurrency: usize,
}

impl Default for CreateServerConfig {
    fn default() -> Self {
        CreateServerConfig {
            max_retries: 3,
            backoff_base: Duration::from_secs(15),
            global_concurrency: 2,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            convergence_tenants: Vec::new(),
            worker: WorkerConfig::default(),
            region_overrides: HashMap::new(),
            create_server: CreateServerConfig::default(),
            step_parallelism: 10,
            delete_timeout: Duration::from_secs(3600),
            cycle_timeout: Duration::from_secs(20 * 60),
            lock_acquire_timeout: Duration::from_secs(150),
            lock_release_timeout: Duration::from_secs(150),
            converger_poll_interval_range: (Duration::from_secs(3), Duration::from_secs(10)),
            http_call_deadline: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn tenant_is_enabled(&self, tenant_id: &str) -> bool {
        self.convergence_tenants.iter().any(|t| t == tenant_id)
    }
}
