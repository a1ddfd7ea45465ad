use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::settings::CoordinatorConfig;

/// Loads configuration in layered precedence, lowest to highest:
///
/// 1. [`CoordinatorConfig::default`]
/// 2. an optional TOML file at `toml_path`
/// 3. `TAGKEEPER_*` environment variables (a `.env` file is loaded first,
///    if present, via `dotenvy`)
///
/// CLI flags (see [`crate::cli`]) apply on top of this as a fourth layer,
/// left to the binary crate since only it knows which flags were passed.
pub fn load(toml_path: Option<&Path>) -> Result<CoordinatorConfig> {
    let _ = dotenvy::dotenv();

    let mut config = CoordinatorConfig::default();

    if let Some(path) = toml_path {
        config = load_toml_layer(path, config)?;
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

fn load_toml_layer(path: &Path, base: CoordinatorConfig) -> Result<CoordinatorConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let from_file: CoordinatorConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    debug!(path = %path.display(), "loaded config file");
    // TOML layer fully replaces fields it names; fields it omits keep
    // `base`'s value courtesy of each struct's `#[serde(default)]`.
    let _ = base;
    Ok(from_file)
}

fn apply_env_overrides(config: &mut CoordinatorConfig) {
    env_usize("TAGKEEPER_WORKER_COUNT", &mut config.worker_pool.worker_count);
    env_u64_duration(
        "TAGKEEPER_DISCOVERY_IDLE_INTERVAL",
        &mut config.worker_pool.discovery_idle_interval_ms,
        DurationUnit::Millis,
    );
    env_u64_duration(
        "TAGKEEPER_HEARTBEAT_INTERVAL_S",
        &mut config.health.heartbeat_interval_s,
        DurationUnit::Seconds,
    );
    env_u32("TAGKEEPER_HEARTBEAT_MAX_MISSES", &mut config.health.heartbeat_max_misses);
    env_u64_duration(
        "TAGKEEPER_STARTUP_TIMEOUT_S",
        &mut config.health.startup_timeout_s,
        DurationUnit::Seconds,
    );
    env_u32("TAGKEEPER_RESTART_MAX_RAPID", &mut config.restart.restart_max_rapid);
    env_u64_duration(
        "TAGKEEPER_RESTART_RAPID_WINDOW_S",
        &mut config.restart.restart_rapid_window_s,
        DurationUnit::Seconds,
    );
    env_u32("TAGKEEPER_RESTART_MAX_LIFETIME", &mut config.restart.restart_max_lifetime);
    env_u64_duration(
        "TAGKEEPER_RESTART_BACKOFF_CAP_S",
        &mut config.restart.restart_backoff_cap_s,
        DurationUnit::Seconds,
    );
    env_u64_duration(
        "TAGKEEPER_CLAIM_SWEEP_INTERVAL_S",
        &mut config.sweeper.claim_sweep_interval_s,
        DurationUnit::Seconds,
    );
    env_u64_duration(
        "TAGKEEPER_STATE_BROKER_POLL_MS",
        &mut config.broker.state_broker_poll_ms,
        DurationUnit::Millis,
    );
    env_f64("TAGKEEPER_CALIBRATION_BIN_WIDTH", &mut config.calibration.calibration_bin_width);
}

enum DurationUnit {
    Seconds,
    Millis,
}

/// Accepts either a bare integer (interpreted in `unit`) or a humantime
/// duration string (e.g. `"5s"`, `"500ms"`), normalizing to `unit`.
fn env_u64_duration(var: &str, target: &mut u64, unit: DurationUnit) {
    let Ok(raw) = std::env::var(var) else { return };
    let parsed = raw.parse::<u64>().ok().or_else(|| {
        humantime::parse_duration(&raw).ok().map(|d| match unit {
            DurationUnit::Seconds => d.as_secs(),
            DurationUnit::Millis => d.as_millis() as u64,
        })
    });
    if let Some(value) = parsed {
        info!(var, value, "config override from environment");
        *target = value;
    }
}

fn env_usize(var: &str, target: &mut usize) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse::<usize>() {
            *target = value;
        }
    }
}

fn env_u32(var: &str, target: &mut u32) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse::<u32>() {
            *target = value;
        }
    }
}

fn env_f64(var: &str, target: &mut f64) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse::<f64>() {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = CoordinatorConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: CoordinatorConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.worker_pool.worker_count, config.worker_pool.worker_count);
        assert_eq!(parsed.health.heartbeat_interval_s, config.health.heartbeat_interval_s);
    }

    #[test]
    fn missing_toml_file_surfaces_read_error() {
        let err = load(Some(Path::new("/nonexistent/tagkeeper.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
