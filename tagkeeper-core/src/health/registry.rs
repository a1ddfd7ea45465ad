use tokio::time::Instant;

use crate::types::{ComponentId, ComponentStatus};
use tagkeeper_config::HealthPolicyConfig;

/// Per-component bookkeeping the monitor loop owns. Never exposed outside
/// the monitor; `health` (C1) only ever sees a write-through projection.
#[derive(Debug)]
pub struct ComponentEntry {
    pub component_id: ComponentId,
    pub component_type: String,
    pub status: ComponentStatus,
    pub policy: HealthPolicyConfig,
    pub next_deadline: Instant,
    pub misses: u32,
    pub pid: Option<u32>,
    pub current_job: Option<String>,
}

impl ComponentEntry {
    pub fn new(component_id: ComponentId, component_type: impl Into<String>, policy: HealthPolicyConfig) -> Self {
        let startup_deadline = Instant::now() + std::time::Duration::from_secs(policy.startup_timeout_s);
        Self {
            component_id,
            component_type: component_type.into(),
            status: ComponentStatus::Starting,
            policy,
            next_deadline: startup_deadline,
            misses: 0,
            pid: None,
            current_job: None,
        }
    }

    pub fn reset_heartbeat_deadline(&mut self) {
        self.misses = 0;
        self.next_deadline = Instant::now() + std::time::Duration::from_secs(self.policy.heartbeat_interval_s);
    }

    pub fn extend_deadline(&mut self, by_s: u64) {
        self.next_deadline += std::time::Duration::from_secs(by_s);
    }

    pub fn register_miss(&mut self) -> bool {
        self.misses += 1;
        self.next_deadline = Instant::now() + std::time::Duration::from_secs(self.policy.heartbeat_interval_s);
        self.misses >= self.policy.heartbeat_max_misses
    }
}
