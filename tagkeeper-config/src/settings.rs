use serde::{Deserialize, Serialize};

/// Where the document store lives. The store itself is in-process
/// (`surrealdb`'s embedded engine); these fields name the namespace/
/// database pair worker subprocesses reconnect to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub namespace: String,
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "tagkeeper".to_string(),
            database: "coordination".to_string(),
        }
    }
}

/// Discovery worker pool sizing (C4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of discovery workers; must be ≥1.
    pub worker_count: usize,
    /// Idle sleep between discovery attempts when nothing is claimable.
    pub discovery_idle_interval_ms: u64,
    /// Consecutive non-file-specific pipeline errors before self-termination.
    pub max_systemic_errors: u32,
    /// Crash count at which a file is marked toxic.
    pub toxic_crash_threshold: u32,
    /// Path (or bare name, resolved against `PATH`) to the worker
    /// subprocess executable the `SpawnFn` execs.
    pub worker_binary: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            discovery_idle_interval_ms: 2_000,
            max_systemic_errors: 10,
            toxic_crash_threshold: 2,
            worker_binary: "tagkeeper-worker".to_string(),
        }
    }
}

/// Health monitor policy (C2), applied uniformly to every registered
/// component unless a caller overrides it per-component.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HealthPolicyConfig {
    pub startup_timeout_s: u64,
    pub heartbeat_interval_s: u64,
    pub heartbeat_max_misses: u32,
}

impl Default for HealthPolicyConfig {
    fn default() -> Self {
        Self {
            startup_timeout_s: 60,
            heartbeat_interval_s: 5,
            heartbeat_max_misses: 3,
        }
    }
}

/// Restart supervisor policy (C3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    pub restart_max_rapid: u32,
    pub restart_rapid_window_s: u64,
    pub restart_max_lifetime: u32,
    pub restart_backoff_cap_s: u64,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            restart_max_rapid: 5,
            restart_rapid_window_s: 300,
            restart_max_lifetime: 20,
            restart_backoff_cap_s: 60,
        }
    }
}

/// Claim sweeper cadence (C5).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SweeperConfig {
    pub claim_sweep_interval_s: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            claim_sweep_interval_s: 30,
        }
    }
}

/// State broker poll cadence (C6).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub state_broker_poll_ms: u64,
    /// Bound on a subscriber's event channel before drop-oldest kicks in.
    pub subscriber_channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            state_broker_poll_ms: 500,
            subscriber_channel_capacity: 256,
        }
    }
}

/// Calibration engine tuning (C7).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub calibration_bin_width: f64,
    pub percentile_low: f64,
    pub percentile_high: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            calibration_bin_width: 0.01,
            percentile_low: 0.05,
            percentile_high: 0.95,
        }
    }
}

/// The full recognized configuration surface from §6.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub health: HealthPolicyConfig,
    #[serde(default)]
    pub restart: RestartPolicyConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}
