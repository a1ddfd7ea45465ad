pub mod sanitize;
pub mod surreal;

pub use sanitize::sanitize_document;
pub use surreal::{Store, WriteOutcome};

/// Collection name constants, so callers never hand-type the strings from §3.
pub mod collections {
    pub const LIBRARY_FILES: &str = "library_files";
    pub const WORKER_CLAIMS: &str = "worker_claims";
    pub const HEALTH: &str = "health";
    pub const WORKER_RESTART_POLICY: &str = "worker_restart_policy";
    pub const CALIBRATION_STATE: &str = "calibration_state";
    pub const CALIBRATION_HISTORY: &str = "calibration_history";
    pub const META: &str = "meta";
}
