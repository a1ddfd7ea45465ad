use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ids::{CalibrationKey, ComponentId, FileKey};

/// `library_files` document (coordination-relevant fields only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryFile {
    #[serde(rename = "_key")]
    pub key: FileKey,
    pub needs_tagging: u8,
    pub tagged: u8,
    pub is_valid: u8,
    pub tagged_version: Option<String>,
    pub last_tagged_at: Option<i64>,
    /// Raw model predictions: model -> head -> label -> score.
    #[serde(default)]
    pub predictions: HashMap<String, HashMap<String, HashMap<String, f64>>>,
    /// Calibrated tags written by `write_calibrated_tags`.
    #[serde(default)]
    pub calibrated_tags: HashMap<String, CalibratedTag>,
    #[serde(default)]
    pub error: Option<String>,
}

impl LibraryFile {
    pub fn is_claimable(&self) -> bool {
        self.needs_tagging == 1 && self.is_valid == 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratedTag {
    pub calibrated_value: f64,
    pub tier: String,
}

/// `worker_claims` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerClaim {
    #[serde(rename = "_key")]
    pub key: String,
    pub file_id: FileKey,
    pub worker_id: ComponentId,
    pub claimed_at_ms: i64,
}

impl WorkerClaim {
    pub fn new(file_key: &FileKey, worker_id: ComponentId, claimed_at_ms: i64) -> Self {
        Self {
            key: file_key.claim_key(),
            file_id: file_key.clone(),
            worker_id,
            claimed_at_ms,
        }
    }
}

/// Component status as tracked by C2. `health` mirrors this but is never
/// read back to recompute it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Starting,
    Healthy,
    Recovering,
    Stopping,
    Dead,
    Crashed,
    Failed,
}

impl ComponentStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, ComponentStatus::Failed)
    }
}

/// `health` document: write-through logging mirror, never read for decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    #[serde(rename = "_key")]
    pub component_id: ComponentId,
    pub component_type: String,
    pub status: ComponentStatus,
    pub pid: Option<u32>,
    pub current_job: Option<String>,
    pub details_json: Option<serde_json::Value>,
    pub updated_at_ms: i64,
}

/// `worker_restart_policy` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicyRecord {
    #[serde(rename = "_key")]
    pub component_id: ComponentId,
    pub restart_count: u32,
    pub last_restart_wall_ms: Option<i64>,
    pub failed_at_wall_ms: Option<i64>,
    pub failure_reason: Option<String>,
}

impl RestartPolicyRecord {
    pub fn fresh(component_id: ComponentId) -> Self {
        Self {
            component_id,
            restart_count: 0,
            last_restart_wall_ms: None,
            failed_at_wall_ms: None,
            failure_reason: None,
        }
    }
}

/// `WorkerSystem::status`'s user-visible projection: C2's current status
/// for the component joined with C3's restart bookkeeping, so a caller
/// never has to read `worker_restart_policy` on the side to find out why
/// a worker is `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub component_id: ComponentId,
    pub status: ComponentStatus,
    pub restart_count: u32,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Percentiles {
    pub p5: f64,
    pub p95: f64,
}

/// Sparse histogram: only non-empty `(bin_center, count)` pairs are kept.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SparseHistogram {
    pub bins: Vec<f64>,
    pub counts: Vec<u64>,
    pub n: u64,
    pub percentiles: Percentiles,
}

/// `calibration_state` document: one per `(model, head, label)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationState {
    #[serde(rename = "_key")]
    pub key: CalibrationKey,
    pub histogram: SparseHistogram,
    pub updated_at_ms: i64,
}

/// `calibration_history` append-only snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationHistoryEntry {
    pub key: CalibrationKey,
    pub histogram: SparseHistogram,
    pub apd: f64,
    pub srd: f64,
    pub jsd: f64,
    pub recorded_at_ms: i64,
}

/// Generic `meta` key-value row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEntry {
    #[serde(rename = "_key")]
    pub key: String,
    pub value: String,
}
