//! Health Monitor (C2): registers subprocess/worker components, reads
//! heartbeat frames over IPC pipes, enforces startup timeout and
//! staleness policy, and emits status-change callbacks.
//!
//! The monitoring loop runs on one dedicated task (the async analogue of
//! the spec's "single dedicated thread"). Each registered pipe gets its
//! own line-reading task that forwards decoded frames and EOF notices
//! onto a shared channel the monitor loop selects over, which is how a
//! single-threaded wait-with-timeout is expressed over N independent
//! `AsyncRead` sources in tokio.

pub mod heartbeat;
pub mod registry;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{collections, Store};
use crate::sweeper::ClaimSweeper;
use crate::types::{ComponentId, ComponentStatus, HealthRecord};
use tagkeeper_config::HealthPolicyConfig;

use heartbeat::{FrameStatus, HeartbeatFrame};
use registry::ComponentEntry;

/// Extra context handed to [`HealthListener::on_status_change`] — currently
/// just the reason a `dead` transition fired, useful for logging and for
/// C3's crash attribution (see SPEC_FULL.md's open-question decision).
#[derive(Debug, Clone, Default)]
pub struct StatusChangeContext {
    pub reason: Option<String>,
    pub current_job: Option<String>,
}

/// Implemented by the restart supervisor (C3). Invoked for every observed
/// status transition, most importantly `-> Dead`.
#[async_trait]
pub trait HealthListener: Send + Sync {
    async fn on_status_change(
        &self,
        component_id: &ComponentId,
        old: ComponentStatus,
        new: ComponentStatus,
        context: StatusChangeContext,
    );
}

enum MonitorEvent {
    Frame(ComponentId, HeartbeatFrame),
    Eof(ComponentId),
    MalformedFrame(ComponentId, String),
}

pub struct HealthMonitor {
    entries: Arc<DashMap<ComponentId, ComponentEntry>>,
    /// Set once, after construction, by whoever builds the restart
    /// supervisor — the supervisor needs an `Arc<HealthMonitor>` to call
    /// [`HealthMonitor::set_failed`], so it can't be handed to this
    /// constructor without the two types holding a reference cycle.
    listener: OnceLock<Arc<dyn HealthListener>>,
    store: Arc<Store>,
    /// Set once, after construction — `ClaimSweeper` needs an
    /// `Arc<HealthMonitor>` to consult [`Self::status_of`] for the
    /// authoritative liveness decision, so it can't be handed to this
    /// constructor without the two types holding a reference cycle.
    sweeper: OnceLock<Arc<ClaimSweeper>>,
    shutdown: CancellationToken,
    event_tx: mpsc::UnboundedSender<MonitorEvent>,
    /// Behind a lock (rather than a field `run` takes by value) so
    /// `HealthMonitor` can be run from an `Arc` shared with everything
    /// else that needs to call `register`/`set_failed`/`status_of` on it.
    event_rx: AsyncMutex<mpsc::UnboundedReceiver<MonitorEvent>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<Store>, shutdown: CancellationToken) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            entries: Arc::new(DashMap::new()),
            listener: OnceLock::new(),
            store,
            sweeper: OnceLock::new(),
            shutdown,
            event_tx,
            event_rx: AsyncMutex::new(event_rx),
        }
    }

    /// Wires the restart supervisor in as the status-change listener.
    /// Must be called before [`Self::run`] starts; panics if called twice.
    pub fn set_listener(&self, listener: Arc<dyn HealthListener>) {
        self.listener.set(listener).ok().expect("health monitor listener already set");
    }

    /// Wires the claim sweeper in. Must be called before [`Self::run`]
    /// starts; panics if called twice.
    pub fn set_sweeper(&self, sweeper: Arc<ClaimSweeper>) {
        self.sweeper.set(sweeper).ok().expect("health monitor sweeper already set");
    }

    /// Registers a component and its IPC pipe read-end, spawning the
    /// task that turns pipe bytes into [`MonitorEvent`]s.
    pub fn register<R>(&self, component_id: ComponentId, component_type: impl Into<String>, pipe: R, policy: HealthPolicyConfig)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let entry = ComponentEntry::new(component_id.clone(), component_type, policy);
        self.entries.insert(component_id.clone(), entry);

        let tx = self.event_tx.clone();
        let id_for_task = component_id.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        let _ = tx.send(MonitorEvent::Eof(id_for_task.clone()));
                        break;
                    }
                    Ok(_) => match HeartbeatFrame::decode(&line) {
                        Ok(frame) => {
                            if tx.send(MonitorEvent::Frame(id_for_task.clone(), frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(MonitorEvent::MalformedFrame(id_for_task.clone(), e.to_string()));
                        }
                    },
                    Err(_) => {
                        let _ = tx.send(MonitorEvent::Eof(id_for_task.clone()));
                        break;
                    }
                }
            }
        });

        info!(component_id = %component_id, "registered component with health monitor");
    }

    pub fn status_of(&self, component_id: &ComponentId) -> Option<ComponentStatus> {
        self.entries.get(component_id).map(|e| e.status)
    }

    pub fn all_statuses(&self) -> Vec<(ComponentId, ComponentStatus)> {
        self.entries
            .iter()
            .map(|e| (e.component_id.clone(), e.status))
            .collect()
    }

    /// Runs the monitor loop until `shutdown` is cancelled. Intended to be
    /// spawned once as its own task for the process lifetime.
    pub async fn run(&self) {
        let mut sweep_ticker = tokio::time::interval(Duration::from_secs(30));
        sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut event_rx = self.event_rx.lock().await;

        loop {
            let deadline = self.nearest_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("health monitor shutting down");
                    break;
                }
                event = event_rx.recv() => {
                    match event {
                        Some(e) => self.handle_event(e).await,
                        None => break,
                    }
                }
                _ = sweep_ticker.tick() => {
                    match self.sweeper.get() {
                        Some(sweeper) => {
                            if let Err(e) = sweeper.sweep_once().await {
                                warn!(error = %e, "claim sweep failed");
                            }
                        }
                        None => warn!("no claim sweeper wired yet, skipping sweep tick"),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.check_deadlines().await;
                }
            }
        }
    }

    fn nearest_deadline(&self) -> Instant {
        self.entries
            .iter()
            .map(|e| e.next_deadline)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(1))
    }

    async fn handle_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Frame(component_id, frame) => self.handle_frame(component_id, frame).await,
            MonitorEvent::Eof(component_id) => self.handle_eof(component_id).await,
            MonitorEvent::MalformedFrame(component_id, reason) => {
                warn!(component_id = %component_id, reason, "malformed heartbeat frame, ignoring");
            }
        }
    }

    async fn handle_frame(&self, component_id: ComponentId, frame: HeartbeatFrame) {
        let transition = {
            let Some(mut entry) = self.entries.get_mut(&component_id) else {
                return;
            };
            let old = entry.status;
            entry.pid = frame.pid;
            entry.current_job = frame.current_job.clone();
            match frame.status {
                FrameStatus::Healthy => {
                    entry.status = ComponentStatus::Healthy;
                    entry.reset_heartbeat_deadline();
                }
                FrameStatus::Recovering => {
                    entry.status = ComponentStatus::Recovering;
                    if let Some(extend) = frame.clamped_recover_for_s() {
                        entry.extend_deadline(extend);
                    }
                }
                FrameStatus::Starting => {
                    entry.status = ComponentStatus::Starting;
                }
                FrameStatus::Stopping => {
                    entry.status = ComponentStatus::Stopping;
                }
            }
            (old, entry.status, entry.current_job.clone())
        };
        let (old, new, current_job) = transition;
        if old != new {
            self.on_transition(&component_id, old, new, StatusChangeContext { reason: None, current_job })
                .await;
        }
    }

    async fn handle_eof(&self, component_id: ComponentId) {
        let old = self.entries.get(&component_id).map(|e| e.status);
        let current_job = self.entries.get(&component_id).and_then(|e| e.current_job.clone());
        if let Some(mut entry) = self.entries.get_mut(&component_id) {
            entry.status = ComponentStatus::Dead;
        }
        if let Some(old) = old {
            self.on_transition(
                &component_id,
                old,
                ComponentStatus::Dead,
                StatusChangeContext { reason: Some("pipe-eof".into()), current_job },
            )
            .await;
        }
    }

    async fn check_deadlines(&self) {
        let now = Instant::now();
        let mut dead: Vec<(ComponentId, ComponentStatus, Option<String>)> = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.next_deadline > now {
                continue;
            }
            match entry.status {
                ComponentStatus::Starting => {
                    let old = entry.status;
                    entry.status = ComponentStatus::Dead;
                    dead.push((entry.component_id.clone(), old, Some("startup-timeout".into())));
                }
                ComponentStatus::Healthy | ComponentStatus::Recovering => {
                    let old = entry.status;
                    let exhausted = entry.register_miss();
                    if exhausted {
                        entry.status = ComponentStatus::Dead;
                        dead.push((entry.component_id.clone(), old, Some("heartbeat-timeout".into())));
                    }
                }
                _ => {}
            }
        }
        for (component_id, old, reason) in dead {
            let current_job = self.entries.get(&component_id).and_then(|e| e.current_job.clone());
            self.on_transition(&component_id, old, ComponentStatus::Dead, StatusChangeContext { reason, current_job })
                .await;
        }
    }

    async fn on_transition(
        &self,
        component_id: &ComponentId,
        old: ComponentStatus,
        new: ComponentStatus,
        context: StatusChangeContext,
    ) {
        debug!(component_id = %component_id, ?old, ?new, "component status transition");
        self.mirror_to_store(component_id, new, context.clone());
        if let Some(listener) = self.listener.get() {
            listener.on_status_change(component_id, old, new, context).await;
        } else {
            warn!(component_id = %component_id, "no health listener wired yet, dropping status transition");
        }
    }

    /// Fire-and-forget write to `health`. Never awaited by the caller of
    /// `on_transition` in a way that blocks the monitor loop, and never
    /// read back to make a liveness decision.
    fn mirror_to_store(&self, component_id: &ComponentId, status: ComponentStatus, context: StatusChangeContext) {
        let store = self.store.clone();
        let component_id = component_id.clone();
        let component_type = self
            .entries
            .get(&component_id)
            .map(|e| e.component_type.clone())
            .unwrap_or_default();
        let pid = self.entries.get(&component_id).and_then(|e| e.pid);
        tokio::spawn(async move {
            let record = HealthRecord {
                component_id: component_id.clone(),
                component_type,
                status,
                pid,
                current_job: context.current_job,
                details_json: context.reason.map(|r| serde_json::json!({ "reason": r })),
                updated_at_ms: crate::time::now_ms(),
            };
            if let Err(e) = store.upsert(collections::HEALTH, record.component_id.as_str(), &record).await {
                warn!(component_id = %component_id, error = %e, "health mirror write failed (non-fatal)");
            }
        });
    }

    pub fn set_failed(&self, component_id: &ComponentId) {
        if let Some(mut entry) = self.entries.get_mut(component_id) {
            entry.status = ComponentStatus::Failed;
        }
        self.mirror_to_store(component_id, ComponentStatus::Failed, StatusChangeContext::default());
    }
}
