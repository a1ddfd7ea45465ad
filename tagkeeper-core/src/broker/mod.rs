//! State Broker (C6): polls a fixed set of topic families out of the
//! document store every `state_broker_poll_ms`, diffs them against the
//! last known snapshot, and republishes only what changed.
//!
//! Live updates fan out over a [`tokio::sync::broadcast`] channel, which
//! already gives every subscriber exactly the semantics the spec asks
//! for — bounded capacity, and a lagging subscriber silently loses its
//! oldest unread events (`RecvError::Lagged`) instead of ever blocking
//! the poll loop. The one thing broadcast doesn't do — a subscriber-
//! specific initial snapshot — is handled by queuing those events
//! locally in the returned [`Subscription`] ahead of the live stream.

pub mod topic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{collections, Store};
use crate::time::now_ms;
use crate::types::{HealthRecord, MetaEntry, RestartPolicyRecord};
use tagkeeper_config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Snapshot,
    Update,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BrokerEvent {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp_ms: i64,
    pub payload: Value,
}

/// A subscriber's view of the broker: an initial snapshot for every
/// topic its patterns currently match, followed by incremental updates.
pub struct Subscription {
    patterns: Vec<String>,
    pending_snapshot: std::collections::VecDeque<BrokerEvent>,
    live: broadcast::Receiver<BrokerEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        if let Some(event) = self.pending_snapshot.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    if self.patterns.iter().any(|p| topic::matches(p, &event.topic)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "broker subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct StateBroker {
    store: Arc<Store>,
    snapshot: DashMap<String, Value>,
    tx: broadcast::Sender<BrokerEvent>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl StateBroker {
    pub fn new(store: Arc<Store>, config: BrokerConfig, shutdown: CancellationToken) -> Self {
        let (tx, _rx) = broadcast::channel(config.subscriber_channel_capacity.max(1));
        Self {
            store,
            snapshot: DashMap::new(),
            tx,
            poll_interval: Duration::from_millis(config.state_broker_poll_ms),
            shutdown,
        }
    }

    /// Patterns may contain a single literal `*` wildcard segment.
    pub fn subscribe(&self, patterns: Vec<String>) -> Subscription {
        let pending_snapshot = self
            .snapshot
            .iter()
            .filter(|entry| patterns.iter().any(|p| topic::matches(p, entry.key())))
            .map(|entry| BrokerEvent {
                topic: entry.key().clone(),
                kind: EventKind::Snapshot,
                timestamp_ms: now_ms(),
                payload: entry.value().clone(),
            })
            .collect();
        Subscription { patterns, pending_snapshot, live: self.tx.subscribe() }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("state broker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "state broker poll failed");
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        for (topic, value) in self.refresh().await? {
            let changed = match self.snapshot.get(&topic) {
                Some(existing) => *existing != value,
                None => true,
            };
            if !changed {
                continue;
            }
            self.snapshot.insert(topic.clone(), value.clone());
            let event = BrokerEvent { topic: topic.clone(), kind: EventKind::Update, timestamp_ms: now_ms(), payload: value };
            debug!(topic, "state broker publishing changed topic");
            // No subscribers is a normal, expected state; ignore SendError.
            let _ = self.tx.send(event);
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<Vec<(String, Value)>> {
        let mut updates = Vec::new();
        let mut binds = HashMap::new();
        binds.insert("tb".to_string(), collections::META.into());
        let meta_entries: Vec<MetaEntry> = self.store.query("SELECT * FROM type::table($tb)", binds).await?;

        let mut queue_statuses = serde_json::Map::new();
        for m in &meta_entries {
            if let Some(job_type) = m.key.strip_prefix("queue:").and_then(|rest| rest.strip_suffix(":stats")) {
                if let Ok(v) = serde_json::from_str::<Value>(&m.value) {
                    updates.push((format!("queue:{job_type}:status"), v.clone()));
                    queue_statuses.insert(job_type.to_string(), v);
                }
            }
        }
        if !queue_statuses.is_empty() {
            updates.push(("queue:status".into(), Value::Object(queue_statuses)));
        }

        let mut jobs: HashMap<String, serde_json::Map<String, Value>> = HashMap::new();
        for m in &meta_entries {
            if let Some(rest) = m.key.strip_prefix("job:") {
                if let Some((id, field)) = rest.split_once(':') {
                    jobs.entry(id.to_string()).or_default().insert(field.to_string(), Value::String(m.value.clone()));
                }
            }
        }
        if !jobs.is_empty() {
            updates.push(("queue:jobs".into(), serde_json::json!(jobs)));
        }

        let mut health_binds = HashMap::new();
        health_binds.insert("tb".to_string(), collections::HEALTH.into());
        let health_entries: Vec<HealthRecord> = self.store.query("SELECT * FROM type::table($tb)", health_binds).await?;

        let mut restart_binds = HashMap::new();
        restart_binds.insert("tb".to_string(), collections::WORKER_RESTART_POLICY.into());
        let restart_entries: Vec<RestartPolicyRecord> =
            self.store.query("SELECT * FROM type::table($tb)", restart_binds).await?;
        let restart_by_component: HashMap<String, &RestartPolicyRecord> =
            restart_entries.iter().map(|r| (r.component_id.to_string(), r)).collect();

        let mut system_health = serde_json::Map::new();
        for h in &health_entries {
            let topic = format!("worker:{}:{}:status", h.component_type, h.component_id);
            let (restart_count, failure_reason) = match restart_by_component.get(&h.component_id.to_string()) {
                Some(r) => (r.restart_count, r.failure_reason.clone()),
                None => (0, None),
            };
            updates.push((
                topic,
                serde_json::json!({
                    "status": h.status,
                    "current_job": h.current_job,
                    "restart_count": restart_count,
                    "failure_reason": failure_reason,
                }),
            ));
            system_health.insert(
                h.component_id.to_string(),
                serde_json::json!({ "status": h.status, "restart_count": restart_count, "failure_reason": failure_reason }),
            );
        }
        updates.push(("system:health".into(), Value::Object(system_health)));

        Ok(updates)
    }
}
