//! Wires C1 through C7 together into the single long-lived type a binary
//! built on this crate constructs once at startup.
//!
//! Three reference cycles had to be broken to make this wiring possible
//! without a component holding a strong back-reference to something that
//! also holds a strong reference to it:
//!
//! - `WorkerSystem` (C4) owns the [`restart::SpawnFn`] handed to the
//!   restart supervisor (C3) at construction; the supervisor never holds
//!   a reference back to `WorkerSystem` itself.
//! - `HealthMonitor` (C2) is built first, with no listener; the restart
//!   supervisor is built next (it needs an `Arc<HealthMonitor>` to call
//!   `set_failed`), and is then installed as the monitor's listener via
//!   [`health::HealthMonitor::set_listener`], called once before the
//!   monitor's run loop starts.
//! - `HealthMonitor` is also built before the claim sweeper (C5), which
//!   needs an `Arc<HealthMonitor>` to consult `status_of` for liveness,
//!   and is installed the same way via
//!   [`health::HealthMonitor::set_sweeper`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::StateBroker;
use crate::calibration;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::restart::{RestartSupervisor, SpawnFn};
use crate::store::Store;
use crate::sweeper::{ClaimSweeper, SweepConfig};
use crate::types::CalibrationKey;
use crate::workers::{SubprocessSpawner, WorkerSystem};
use tagkeeper_config::CoordinatorConfig;

/// The coordination core for one process lifetime. Owns the document
/// store handle, the health monitor, the restart supervisor, the
/// discovery worker pool, the claim sweeper (driven from inside the
/// monitor's own loop), and the state broker. The calibration engine is
/// invoked on demand via [`Coordinator::run_calibration_cycle`] rather
/// than run as its own background loop.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<Store>,
    health_monitor: Arc<HealthMonitor>,
    restart_supervisor: Arc<RestartSupervisor>,
    worker_system: Arc<WorkerSystem>,
    broker: Arc<StateBroker>,
    shutdown: CancellationToken,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        let store = Arc::new(Store::connect(&config.store.namespace, &config.store.database).await?);
        let shutdown = CancellationToken::new();

        let health_monitor = Arc::new(HealthMonitor::new(store.clone(), shutdown.clone()));

        let sweeper = Arc::new(ClaimSweeper::new(
            store.clone(),
            health_monitor.clone(),
            SweepConfig {
                toxic_crash_threshold: config.worker_pool.toxic_crash_threshold,
                job_type: "tag".to_string(),
            },
        ));
        health_monitor.set_sweeper(sweeper);

        let spawner = Arc::new(SubprocessSpawner::new(
            health_monitor.clone(),
            config.health,
            config.store.clone(),
            config.worker_pool.worker_binary.clone(),
        ));

        let restart_supervisor = RestartSupervisor::new(
            store.clone(),
            health_monitor.clone(),
            spawner.clone() as Arc<dyn SpawnFn>,
            config.restart,
            shutdown.clone(),
        );
        health_monitor.set_listener(restart_supervisor.clone());

        let worker_system = Arc::new(WorkerSystem::new(store.clone(), config.worker_pool.clone(), spawner, health_monitor.clone()));
        let broker = Arc::new(StateBroker::new(store.clone(), config.broker, shutdown.clone()));

        Ok(Self {
            config,
            store,
            health_monitor,
            restart_supervisor,
            worker_system,
            broker,
            shutdown,
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn worker_system(&self) -> &Arc<WorkerSystem> {
        &self.worker_system
    }

    pub fn broker(&self) -> &Arc<StateBroker> {
        &self.broker
    }

    pub async fn statuses(&self) -> Result<Vec<crate::types::WorkerStatus>> {
        self.worker_system.status().await
    }

    /// Spawns the health monitor and state broker loops, then starts the
    /// worker pool. Call once at process startup.
    pub async fn start(&self) -> Result<()> {
        let monitor_handle = {
            let monitor = self.health_monitor.clone();
            tokio::spawn(async move { monitor.run().await })
        };
        let broker_handle = {
            let broker = self.broker.clone();
            tokio::spawn(async move { broker.run().await })
        };
        self.background.lock().unwrap().extend([monitor_handle, broker_handle]);

        self.worker_system.start_all().await?;
        info!("coordinator started");
        Ok(())
    }

    /// Graceful shutdown: cancel the shutdown token and every pending
    /// restart timer first, then tear down the worker pool. Cancelling
    /// first closes the window where a worker dying during `stop_all`'s
    /// teardown could otherwise get a restart scheduled after shutdown
    /// has already begun — `RestartSupervisor::on_status_change` checks
    /// `shutdown.is_cancelled()` before scheduling anything.
    pub async fn stop(&self, worker_stop_timeout: Duration) -> Result<()> {
        self.shutdown.cancel();
        self.restart_supervisor.cancel_all_timers();
        self.worker_system.stop_all(worker_stop_timeout).await?;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("coordinator stopped");
        Ok(())
    }

    /// Runs one full calibration pass: rebuild histograms for every
    /// `(model, head, label)` triple currently observed, record a drift
    /// snapshot for each, then apply calibration to `library_files`.
    pub async fn run_calibration_cycle(&self) -> Result<Vec<CalibrationKey>> {
        let keys = calibration::generate_calibration(&self.store, &self.config.calibration).await?;
        for key in &keys {
            calibration::record_history(&self.store, key, &self.config.calibration).await?;
            calibration::write_calibrated_tags(&self.store, key).await?;
        }
        Ok(keys)
    }
}
