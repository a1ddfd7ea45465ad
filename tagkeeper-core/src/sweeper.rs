//! Claim Sweeper (C5): reclaims `worker_claims` left behind by dead
//! workers or pointing at files that no longer need tagging. Driven from
//! inside C2's monitor cycle rather than running its own timer, so a
//! single dedicated loop owns both "is a component alive" and "is a
//! claim still meaningful" — the two questions the spec ties together.
//!
//! Liveness for sweep 1 is never inferred from a store timestamp. The
//! sweeper asks [`HealthMonitor::status_of`] for C2's in-memory,
//! authoritative view of the worker — the same view C2 itself uses to
//! decide whether to fire a restart — and treats anything other than
//! `Some(Dead)`/`Some(Failed)` as still alive, including an unregistered
//! worker id, which counts as dead (nothing vouches for it).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::health::HealthMonitor;
use crate::store::{collections, Store};
use crate::types::{ComponentStatus, LibraryFile, WorkerClaim};
use crate::workers::claim::record_crash_and_maybe_toxify;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub toxic_crash_threshold: u32,
    pub job_type: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub dead_worker_claims: u64,
    pub finished_file_claims: u64,
    pub invalid_file_claims: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.dead_worker_claims + self.finished_file_claims + self.invalid_file_claims
    }
}

pub struct ClaimSweeper {
    store: Arc<Store>,
    health_monitor: Arc<HealthMonitor>,
    config: SweepConfig,
}

impl ClaimSweeper {
    pub fn new(store: Arc<Store>, health_monitor: Arc<HealthMonitor>, config: SweepConfig) -> Self {
        Self { store, health_monitor, config }
    }

    /// Runs all three sweep queries once. Safe to call on a fixed cadence;
    /// every deletion it issues is idempotent, so overlapping sweeps (or a
    /// sweep racing a worker's own claim delete) are harmless.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let claims: Vec<WorkerClaim> = self.all_claims().await?;
        if claims.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport::default();

        for claim in claims {
            if self.is_worker_dead(&claim) {
                let _ = record_crash_and_maybe_toxify(
                    &self.store,
                    &self.config.job_type,
                    &claim.file_id,
                    self.config.toxic_crash_threshold,
                )
                .await;
                self.store.delete(collections::WORKER_CLAIMS, &claim.key).await?;
                report.dead_worker_claims += 1;
                debug!(file_key = %claim.file_id, worker_id = %claim.worker_id, "swept claim of dead worker");
                continue;
            }

            match self.store.get::<LibraryFile>(collections::LIBRARY_FILES, claim.file_id.as_str()).await? {
                None => {
                    self.store.delete(collections::WORKER_CLAIMS, &claim.key).await?;
                    report.invalid_file_claims += 1;
                    debug!(file_key = %claim.file_id, "swept claim of missing file");
                }
                Some(file) if file.is_valid == 0 => {
                    self.store.delete(collections::WORKER_CLAIMS, &claim.key).await?;
                    report.invalid_file_claims += 1;
                    debug!(file_key = %claim.file_id, "swept claim of invalidated file");
                }
                Some(file) if file.tagged == 1 || file.needs_tagging == 0 => {
                    self.store.delete(collections::WORKER_CLAIMS, &claim.key).await?;
                    report.finished_file_claims += 1;
                    debug!(file_key = %claim.file_id, "swept claim of already-finished file");
                }
                Some(_) => {}
            }
        }

        if report.total() > 0 {
            info!(
                dead_worker = report.dead_worker_claims,
                finished_file = report.finished_file_claims,
                invalid_file = report.invalid_file_claims,
                "claim sweep reclaimed claims"
            );
        }
        Ok(report)
    }

    async fn all_claims(&self) -> Result<Vec<WorkerClaim>> {
        let mut binds = HashMap::new();
        binds.insert("tb".to_string(), collections::WORKER_CLAIMS.into());
        self.store.query("SELECT * FROM type::table($tb)", binds).await
    }

    fn is_worker_dead(&self, claim: &WorkerClaim) -> bool {
        match self.health_monitor.status_of(&claim.worker_id) {
            None | Some(ComponentStatus::Dead) | Some(ComponentStatus::Failed) => true,
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WriteOutcome;
    use crate::time::now_ms;
    use crate::types::{ComponentId, FileKey};
    use tokio_util::sync::CancellationToken;

    async fn store() -> Arc<Store> {
        Arc::new(Store::connect("sweeper_tests", "db").await.unwrap())
    }

    fn config() -> SweepConfig {
        SweepConfig { toxic_crash_threshold: 2, job_type: "tag".into() }
    }

    async fn health_monitor(store: Arc<Store>) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(store, CancellationToken::new()))
    }

    /// Registers `worker_id` with the monitor, same as C2 does at worker
    /// spawn time. `status_of` reports this as `Starting` rather than
    /// `Healthy` since nothing is driving the monitor's event loop in
    /// these tests, but that's still "not dead" as far as the sweeper
    /// cares — it only treats `None`/`Dead`/`Failed` as a worker to reap.
    fn register(monitor: &HealthMonitor, worker_id: &str) {
        monitor.register(
            ComponentId::new(worker_id),
            "discovery-worker",
            tokio::io::empty(),
            tagkeeper_config::HealthPolicyConfig::default(),
        );
    }

    async fn seed_file(store: &Store, key: &str, needs_tagging: u8, tagged: u8, is_valid: u8) {
        let file = LibraryFile {
            key: FileKey::new(key),
            needs_tagging,
            tagged,
            is_valid,
            tagged_version: None,
            last_tagged_at: None,
            predictions: Default::default(),
            calibrated_tags: Default::default(),
            error: None,
        };
        store.upsert(collections::LIBRARY_FILES, key, &file).await.unwrap();
    }

    async fn seed_claim(store: &Store, file_key: &str, worker_id: &str) {
        let claim = WorkerClaim::new(&FileKey::new(file_key), ComponentId::new(worker_id), now_ms());
        let outcome = store.insert(collections::WORKER_CLAIMS, &claim.key, &claim).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Inserted);
    }

    #[tokio::test]
    async fn sweeps_claim_of_worker_with_no_health_record() {
        let s = store().await;
        seed_file(&s, "a", 1, 0, 1).await;
        seed_claim(&s, "a", "ghost-worker").await;

        let monitor = health_monitor(s.clone()).await;
        let sweeper = ClaimSweeper::new(s.clone(), monitor, config());
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.dead_worker_claims, 1);
        assert!(!s.has(collections::WORKER_CLAIMS, &FileKey::new("a").claim_key()).await.unwrap());
    }

    #[tokio::test]
    async fn does_not_sweep_claim_of_registered_healthy_worker() {
        let s = store().await;
        seed_file(&s, "a", 1, 0, 1).await;
        seed_claim(&s, "a", "w0").await;

        let monitor = health_monitor(s.clone()).await;
        register(&monitor, "w0");

        let sweeper = ClaimSweeper::new(s.clone(), monitor, config());
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(s.has(collections::WORKER_CLAIMS, &FileKey::new("a").claim_key()).await.unwrap());
    }

    #[tokio::test]
    async fn sweeps_claim_of_already_tagged_file() {
        let s = store().await;
        seed_file(&s, "a", 0, 1, 1).await;
        seed_claim(&s, "a", "w0").await;

        let monitor = health_monitor(s.clone()).await;
        register(&monitor, "w0");

        let report = ClaimSweeper::new(s.clone(), monitor, config()).sweep_once().await.unwrap();
        assert_eq!(report.finished_file_claims, 1);
    }

    #[tokio::test]
    async fn sweeps_claim_of_missing_file() {
        let s = store().await;
        seed_claim(&s, "ghost-file", "w0").await;
        let monitor = health_monitor(s.clone()).await;
        let report = ClaimSweeper::new(s.clone(), monitor, config()).sweep_once().await.unwrap();
        assert_eq!(report.invalid_file_claims, 1);
    }

    #[tokio::test]
    async fn repeated_sweeps_are_idempotent() {
        let s = store().await;
        seed_claim(&s, "ghost-file", "w0").await;
        let monitor = health_monitor(s.clone()).await;
        let sweeper = ClaimSweeper::new(s.clone(), monitor, config());
        assert_eq!(sweeper.sweep_once().await.unwrap().total(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap().total(), 0);
    }
}
