pub mod ids;
pub mod records;

pub use ids::{CalibrationKey, ComponentId, FileKey};
pub use records::{
    CalibratedTag, CalibrationHistoryEntry, CalibrationState, ComponentStatus, HealthRecord,
    LibraryFile, MetaEntry, Percentiles, RestartPolicyRecord, SparseHistogram, WorkerClaim,
    WorkerStatus,
};
