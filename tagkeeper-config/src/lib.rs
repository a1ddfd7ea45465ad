//! Layered configuration loading for the tagkeeper coordination core.
//!
//! Precedence, lowest to highest: built-in [`settings::CoordinatorConfig`]
//! defaults, an optional TOML file, `TAGKEEPER_*` environment variables,
//! then CLI flags for binaries that opt into the `cli` feature.

#[cfg(feature = "cli")]
pub mod cli;
pub mod error;
pub mod loader;
pub mod settings;

pub use error::{ConfigError, Result};
pub use loader::load;
pub use settings::{
    BrokerConfig, CalibrationConfig, CoordinatorConfig, HealthPolicyConfig, RestartPolicyConfig,
    StoreConfig, SweeperConfig, WorkerPoolConfig,
};
