//! Restart Supervisor (C3): consumes `dead` callbacks from C2, computes
//! restart decisions from persisted counters, schedules backoff timers,
//! and enforces the two-tier rapid/lifetime restart limits.

pub mod policy;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::health::{HealthListener, HealthMonitor, StatusChangeContext};
use crate::store::{collections, Store};
use crate::time::now_ms;
use crate::types::{ComponentId, ComponentStatus, MetaEntry, RestartPolicyRecord};
use tagkeeper_config::RestartPolicyConfig;

use policy::{should_restart, RestartDecision};

/// Injected by `WorkerSystem` at construction so the supervisor can
/// respawn a dead component without holding a back-reference to
/// `WorkerSystem` itself (see SPEC_FULL.md §9, cycle-breaking guidance).
#[async_trait]
pub trait SpawnFn: Send + Sync {
    async fn spawn(&self, component_id: ComponentId) -> anyhow::Result<()>;
}

pub struct RestartSupervisor {
    store: Arc<Store>,
    health_monitor: Arc<HealthMonitor>,
    spawner: Arc<dyn SpawnFn>,
    config: RestartPolicyConfig,
    pending_timers: DashMap<ComponentId, JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RestartSupervisor {
    pub fn new(store: Arc<Store>, health_monitor: Arc<HealthMonitor>, spawner: Arc<dyn SpawnFn>, config: RestartPolicyConfig, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            store,
            health_monitor,
            spawner,
            config,
            pending_timers: DashMap::new(),
            shutdown,
        })
    }

    /// Cancels every pending restart timer. Must run before worker
    /// shutdown begins, or a timer firing mid-shutdown would respawn a
    /// worker the operator is tearing down.
    pub fn cancel_all_timers(&self) {
        for entry in self.pending_timers.iter() {
            entry.value().abort();
        }
        self.pending_timers.clear();
    }

    /// Operator reset: the only path out of `failed`.
    pub async fn reset(&self, component_id: &ComponentId) -> Result<()> {
        let fresh = RestartPolicyRecord::fresh(component_id.clone());
        self.store
            .upsert(collections::WORKER_RESTART_POLICY, component_id.as_str(), &fresh)
            .await?;
        info!(component_id = %component_id, "restart policy manually reset");
        Ok(())
    }

    async fn get_policy(&self, component_id: &ComponentId) -> Result<RestartPolicyRecord> {
        let existing: Option<RestartPolicyRecord> = self
            .store
            .get(collections::WORKER_RESTART_POLICY, component_id.as_str())
            .await?;
        Ok(existing.unwrap_or_else(|| RestartPolicyRecord::fresh(component_id.clone())))
    }

    async fn increment_policy(&self, component_id: &ComponentId) -> Result<()> {
        let mut record = self.get_policy(component_id).await?;
        record.restart_count += 1;
        record.last_restart_wall_ms = Some(now_ms());
        self.store
            .upsert(collections::WORKER_RESTART_POLICY, component_id.as_str(), &record)
            .await
    }

    async fn mark_failed_policy(&self, component_id: &ComponentId, reason: &str) -> Result<()> {
        let mut record = self.get_policy(component_id).await?;
        record.failed_at_wall_ms = Some(now_ms());
        record.failure_reason = Some(reason.to_string());
        self.store
            .upsert(collections::WORKER_RESTART_POLICY, component_id.as_str(), &record)
            .await
    }

    async fn worker_system_enabled(&self) -> bool {
        let entry: Result<Option<MetaEntry>> = self.store.get(collections::META, "worker_enabled").await;
        match entry {
            Ok(Some(meta)) => meta.value != "0",
            _ => true,
        }
    }

    async fn respawn(self: &Arc<Self>, component_id: ComponentId) {
        if !self.worker_system_enabled().await {
            info!(component_id = %component_id, "worker system disabled, abandoning scheduled respawn");
            return;
        }
        if let Err(e) = self.spawner.spawn(component_id.clone()).await {
            warn!(component_id = %component_id, error = %e, "respawn failed");
        }
    }

}

#[async_trait]
impl HealthListener for RestartSupervisor {
    async fn on_status_change(&self, component_id: &ComponentId, _old: ComponentStatus, new: ComponentStatus, context: StatusChangeContext) {
        if new != ComponentStatus::Dead {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Some((_, old_timer)) = self.pending_timers.remove(component_id) {
            old_timer.abort();
        }

        let policy = match self.get_policy(component_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(component_id = %component_id, error = %e, "failed to load restart policy, treating as fresh");
                RestartPolicyRecord::fresh(component_id.clone())
            }
        };

        let decision = should_restart(policy.restart_count, policy.last_restart_wall_ms, now_ms(), &self.config);
        match decision {
            RestartDecision::Restart { backoff_s } => {
                if let Err(e) = self.increment_policy(component_id).await {
                    warn!(component_id = %component_id, error = %e, "failed to persist restart counter");
                }
                self.schedule_restart_for(component_id.clone(), backoff_s);
            }
            RestartDecision::MarkFailed { reason } => {
                self.health_monitor.set_failed(component_id);
                if let Err(e) = self.mark_failed_policy(component_id, reason).await {
                    warn!(component_id = %component_id, error = %e, "failed to persist failed policy");
                }
                warn!(component_id = %component_id, reason, current_job = ?context.current_job, "component permanently failed");
            }
        }
    }
}

impl RestartSupervisor {
    /// Schedules a respawn `backoff_s` out, plus a few hundred ms of jitter
    /// so a correlated crash of several components (e.g. a shared
    /// dependency going down) doesn't respawn them all on the same tick.
    fn schedule_restart_for(self: &Arc<Self>, component_id: ComponentId, backoff_s: u64) {
        let jitter_ms = rand::rng().random_range(0..=250u64);
        let this = Arc::clone(self);
        let key = component_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(backoff_s) + std::time::Duration::from_millis(jitter_ms)).await;
            this.respawn(component_id).await;
        });
        if let Some(old) = self.pending_timers.insert(key, handle) {
            old.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::sweeper::{ClaimSweeper, SweepConfig};

    /// Records every component id it was asked to spawn; never actually
    /// execs anything. Stands in for the real `SubprocessSpawner` the way
    /// the teacher would use a hand-rolled fake over a mocking framework
    /// for a single-method collaborator trait (see DESIGN.md).
    #[derive(Default)]
    struct RecordingSpawner {
        spawned: std::sync::Mutex<Vec<ComponentId>>,
    }

    #[async_trait]
    impl SpawnFn for RecordingSpawner {
        async fn spawn(&self, component_id: ComponentId) -> anyhow::Result<()> {
            self.spawned.lock().unwrap().push(component_id);
            Ok(())
        }
    }

    async fn store() -> Arc<Store> {
        Arc::new(Store::connect("restart_tests", "db").await.unwrap())
    }

    fn fast_config() -> RestartPolicyConfig {
        RestartPolicyConfig {
            restart_max_rapid: 5,
            restart_rapid_window_s: 300,
            restart_max_lifetime: 20,
            restart_backoff_cap_s: 1,
        }
    }

    async fn supervisor(store: Arc<Store>, spawner: Arc<RecordingSpawner>) -> Arc<RestartSupervisor> {
        let shutdown = CancellationToken::new();
        let health_monitor = Arc::new(HealthMonitor::new(store.clone(), shutdown.clone()));
        let sweeper = Arc::new(ClaimSweeper::new(
            store.clone(),
            health_monitor.clone(),
            SweepConfig { toxic_crash_threshold: 2, job_type: "tag".into() },
        ));
        health_monitor.set_sweeper(sweeper);
        RestartSupervisor::new(store, health_monitor, spawner as Arc<dyn SpawnFn>, fast_config(), shutdown)
    }

    #[tokio::test]
    async fn dead_transition_schedules_a_respawn() {
        let store = store().await;
        let spawner = Arc::new(RecordingSpawner::default());
        let supervisor = supervisor(store, spawner.clone()).await;
        let component_id = ComponentId::new("w0");

        supervisor
            .on_status_change(&component_id, ComponentStatus::Healthy, ComponentStatus::Dead, StatusChangeContext::default())
            .await;

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(spawner.spawned.lock().unwrap().as_slice(), &[component_id]);
    }

    #[tokio::test]
    async fn exhausting_the_lifetime_limit_marks_failed_instead_of_scheduling() {
        let store = store().await;
        let spawner = Arc::new(RecordingSpawner::default());
        let supervisor = supervisor(store.clone(), spawner.clone()).await;
        let component_id = ComponentId::new("w0");

        let exhausted = RestartPolicyRecord { restart_count: 20, ..RestartPolicyRecord::fresh(component_id.clone()) };
        store
            .upsert(collections::WORKER_RESTART_POLICY, component_id.as_str(), &exhausted)
            .await
            .unwrap();

        supervisor
            .on_status_change(&component_id, ComponentStatus::Healthy, ComponentStatus::Dead, StatusChangeContext::default())
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(spawner.spawned.lock().unwrap().is_empty(), "a permanently failed component must not be respawned");
        let policy: RestartPolicyRecord = store
            .get(collections::WORKER_RESTART_POLICY, component_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert!(policy.failed_at_wall_ms.is_some());
    }

    #[tokio::test]
    async fn cancel_all_timers_prevents_a_pending_respawn() {
        let store = store().await;
        let spawner = Arc::new(RecordingSpawner::default());
        let supervisor = supervisor(store, spawner.clone()).await;
        let component_id = ComponentId::new("w0");

        supervisor
            .on_status_change(&component_id, ComponentStatus::Healthy, ComponentStatus::Dead, StatusChangeContext::default())
            .await;
        supervisor.cancel_all_timers();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_clears_a_failed_component_back_to_a_fresh_policy() {
        let store = store().await;
        let spawner = Arc::new(RecordingSpawner::default());
        let supervisor = supervisor(store.clone(), spawner).await;
        let component_id = ComponentId::new("w0");

        let failed = RestartPolicyRecord {
            restart_count: 20,
            failed_at_wall_ms: Some(now_ms()),
            failure_reason: Some("lifetime-restart-limit".into()),
            ..RestartPolicyRecord::fresh(component_id.clone())
        };
        store
            .upsert(collections::WORKER_RESTART_POLICY, component_id.as_str(), &failed)
            .await
            .unwrap();

        supervisor.reset(&component_id).await.unwrap();

        let policy: RestartPolicyRecord = store
            .get(collections::WORKER_RESTART_POLICY, component_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(policy.restart_count, 0);
        assert!(policy.failed_at_wall_ms.is_none());
    }
}
