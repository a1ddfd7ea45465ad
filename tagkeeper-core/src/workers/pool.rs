//! Discovery Worker Pool (C4): owns the set of worker subprocesses and
//! the [`SpawnFn`](crate::restart::SpawnFn) handed to the restart
//! supervisor at construction. `WorkerSystem` never holds a reference to
//! the supervisor — it only ever gets called *by* it, through the trait
//! object, which is what breaks the ownership cycle between "the thing
//! that restarts workers" and "the thing that owns workers".

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::info;

use crate::error::{CoordError, Result};
use crate::health::HealthMonitor;
use crate::restart::SpawnFn;
use crate::store::{collections, Store};
use crate::types::{ComponentId, MetaEntry, RestartPolicyRecord, WorkerStatus};
use tagkeeper_config::{HealthPolicyConfig, StoreConfig, WorkerPoolConfig};

/// Spawns a discovery worker as a real OS process and registers its
/// stdout pipe with the health monitor. This is the only piece of C4
/// that is not unit-testable in-process — it is exercised by running the
/// `tagkeeper-worker` binary itself, not by the in-memory store tests
/// that cover `claim` and `runtime`.
pub struct SubprocessSpawner {
    health_monitor: Arc<HealthMonitor>,
    health_policy: HealthPolicyConfig,
    store_config: StoreConfig,
    worker_binary: std::path::PathBuf,
    children: DashMap<ComponentId, Child>,
}

impl SubprocessSpawner {
    pub fn new(
        health_monitor: Arc<HealthMonitor>,
        health_policy: HealthPolicyConfig,
        store_config: StoreConfig,
        worker_binary: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            health_monitor,
            health_policy,
            store_config,
            worker_binary: worker_binary.into(),
            children: DashMap::new(),
        }
    }

    /// Sends a graceful shutdown signal (SIGTERM on unix) to every live
    /// child, then waits up to `timeout` before reporting which ones are
    /// still outstanding. Callers that need a hard kill should
    /// [`Self::kill_all`] after this returns.
    pub async fn terminate_all(&self, timeout: std::time::Duration) {
        let ids: Vec<ComponentId> = self.children.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some(mut child) = self.children.get_mut(id) {
                if let Some(pid) = child.id() {
                    signal_terminate(pid);
                }
            }
        }
        let _ = tokio::time::timeout(timeout, join_all(ids.iter().map(|id| async move {
            if let Some(mut child) = self.children.get_mut(id) {
                let _ = child.wait().await;
            }
        }))).await;
    }

    pub fn kill_all(&self) {
        for mut entry in self.children.iter_mut() {
            let _ = entry.value_mut().start_kill();
        }
        self.children.clear();
    }
}

#[async_trait]
impl SpawnFn for SubprocessSpawner {
    async fn spawn(&self, component_id: ComponentId) -> anyhow::Result<()> {
        if let Some((_, mut old)) = self.children.remove(&component_id) {
            let _ = old.start_kill();
        }

        let mut cmd = Command::new(&self.worker_binary);
        cmd.arg("--component-id")
            .arg(component_id.as_str())
            .arg("--namespace")
            .arg(&self.store_config.namespace)
            .arg("--database")
            .arg(&self.store_config.database)
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout piped at spawn");
        self.health_monitor
            .register(component_id.clone(), "discovery-worker", stdout, self.health_policy);

        info!(component_id = %component_id, pid = ?child.id(), "spawned discovery worker");
        self.children.insert(component_id, child);
        Ok(())
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) {}

/// The pool itself: sizing, start/stop/pause/resume, and a status
/// projection for the state broker to publish.
pub struct WorkerSystem {
    store: Arc<Store>,
    config: WorkerPoolConfig,
    spawner: Arc<SubprocessSpawner>,
    health_monitor: Arc<HealthMonitor>,
}

impl WorkerSystem {
    pub fn new(store: Arc<Store>, config: WorkerPoolConfig, spawner: Arc<SubprocessSpawner>, health_monitor: Arc<HealthMonitor>) -> Self {
        Self { store, config, spawner, health_monitor }
    }

    /// The [`SpawnFn`] to hand to the restart supervisor at construction.
    pub fn spawner(&self) -> Arc<dyn SpawnFn> {
        self.spawner.clone()
    }

    fn worker_id(index: usize) -> ComponentId {
        ComponentId::new(format!("discovery-worker-{index}"))
    }

    pub async fn start_all(&self) -> Result<()> {
        self.set_enabled(true).await?;
        for i in 0..self.config.worker_count {
            self.spawner
                .spawn(Self::worker_id(i))
                .await
                .map_err(|e| CoordError::transport(format!("failed to spawn worker {i}: {e}")))?;
        }
        Ok(())
    }

    /// Flips the `worker_enabled` meta flag off (so neither the restart
    /// supervisor nor any worker's own loop will keep going), signals
    /// every child, and waits up to `timeout` before escalating to a
    /// hard kill.
    pub async fn stop_all(&self, timeout: std::time::Duration) -> Result<()> {
        self.set_enabled(false).await?;
        self.spawner.terminate_all(timeout).await;
        self.spawner.kill_all();
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_enabled(false).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_enabled(true).await
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.store
            .upsert(
                collections::META,
                "worker_enabled",
                &MetaEntry { key: "worker_enabled".into(), value: if enabled { "1" } else { "0" }.into() },
            )
            .await
    }

    /// Joins C2's in-memory status for every registered component with
    /// C3's persisted restart counter and failure reason, so a caller
    /// sees both halves of "what is this worker doing and why" from one
    /// call.
    pub async fn status(&self) -> Result<Vec<WorkerStatus>> {
        let mut statuses = Vec::new();
        for (component_id, status) in self.health_monitor.all_statuses() {
            let policy: Option<RestartPolicyRecord> =
                self.store.get(collections::WORKER_RESTART_POLICY, component_id.as_str()).await?;
            let (restart_count, failure_reason) = match policy {
                Some(p) => (p.restart_count, p.failure_reason),
                None => (0, None),
            };
            statuses.push(WorkerStatus { component_id, status, restart_count, failure_reason });
        }
        Ok(statuses)
    }
}
