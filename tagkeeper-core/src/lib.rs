//! Work coordination core for a self-hosted music-tagging platform.
//!
//! The document store is the single source of truth for all work state.
//! No component here infers a worker's liveness from a timestamp —
//! [`health::HealthMonitor`] is the only component that decides whether a
//! component is alive, and every other module either defers to it
//! (`restart`, `workers`) or only reads its write-through mirror for
//! reporting (`broker`).

pub mod broker;
pub mod calibration;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod restart;
pub mod store;
pub mod sweeper;
pub mod time;
pub mod types;
pub mod workers;

pub use coordinator::Coordinator;
pub use error::{CoordError, Result};
