//! The discovery/claim/process/finalize loop a worker subprocess runs.
//! Lives here (not in the `tagkeeper-worker` binary) so it can be driven
//! against an in-memory store and a mock [`ProcessingPipeline`] without
//! spawning a real OS process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::{collections, Store};
use crate::types::{ComponentId, FileKey};

use super::claim;
use super::pipeline::{classify, PipelineOutcome, ProcessingPipeline};

/// Shared slot the heartbeat-emitter thread reads from to report
/// `current_job` on every frame. The processing loop is the only writer.
pub type CurrentJobSlot = Arc<Mutex<Option<String>>>;

#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    pub job_type: String,
    pub discovery_idle_interval: Duration,
    pub max_systemic_errors: u32,
    pub toxic_crash_threshold: u32,
}

#[derive(Debug)]
pub enum WorkerExit {
    Stopped,
    SelfTerminated { reason: String },
}

/// Runs until `stop` is cancelled or the systemic-error budget is
/// exhausted (§4.4's self-termination clause). Never panics on a
/// recoverable error — store/pipeline failures are logged and the loop
/// continues, since the worker itself is cheap to keep alive; only
/// consecutive *systemic* pipeline failures count toward self-termination.
pub async fn run_worker_loop(
    store: Arc<Store>,
    worker_id: ComponentId,
    pipeline: Arc<dyn ProcessingPipeline>,
    config: WorkerLoopConfig,
    stop: CancellationToken,
    current_job: CurrentJobSlot,
) -> WorkerExit {
    let mut consecutive_systemic_errors = 0u32;

    loop {
        if stop.is_cancelled() {
            return WorkerExit::Stopped;
        }

        if !worker_system_enabled(&store).await {
            if sleep_or_stop(Duration::from_secs(1), &stop).await {
                return WorkerExit::Stopped;
            }
            continue;
        }

        let candidate = match claim::discover_one(&store).await {
            Ok(c) => c,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "discovery query failed");
                if sleep_or_stop(config.discovery_idle_interval, &stop).await {
                    return WorkerExit::Stopped;
                }
                continue;
            }
        };

        let Some(file_key) = candidate else {
            if sleep_or_stop(config.discovery_idle_interval, &stop).await {
                return WorkerExit::Stopped;
            }
            continue;
        };

        match claim::try_claim(&store, &file_key, &worker_id).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(worker_id = %worker_id, file_key = %file_key, error = %e, "claim attempt failed");
                continue;
            }
        }

        *current_job.lock().unwrap() = Some(file_key.to_string());
        let outcome = classify(pipeline.process(&file_key).await);
        *current_job.lock().unwrap() = None;

        match outcome {
            PipelineOutcome::Success(_value) => {
                consecutive_systemic_errors = 0;
                if let Err(e) = claim::finalize_success(&store, &file_key, pipeline.version()).await {
                    warn!(worker_id = %worker_id, file_key = %file_key, error = %e, "finalize_success failed");
                }
            }
            PipelineOutcome::Toxic(reason) => {
                consecutive_systemic_errors = 0;
                warn!(worker_id = %worker_id, file_key = %file_key, reason, "pipeline reported toxic file");
                if let Err(e) = claim::mark_error(&store, &file_key, &reason).await {
                    warn!(worker_id = %worker_id, file_key = %file_key, error = %e, "mark_error failed");
                }
                if let Err(e) = claim::release_claim(&store, &file_key).await {
                    warn!(worker_id = %worker_id, file_key = %file_key, error = %e, "release_claim failed");
                }
            }
            PipelineOutcome::Systemic(reason) => {
                consecutive_systemic_errors += 1;
                warn!(worker_id = %worker_id, file_key = %file_key, reason, consecutive_systemic_errors, "systemic pipeline error");
                if let Err(e) = claim::release_claim(&store, &file_key).await {
                    warn!(worker_id = %worker_id, file_key = %file_key, error = %e, "release_claim failed");
                }
                if consecutive_systemic_errors >= config.max_systemic_errors {
                    return WorkerExit::SelfTerminated {
                        reason: format!("{consecutive_systemic_errors} consecutive systemic pipeline errors, last: {reason}"),
                    };
                }
            }
        }
    }
}

async fn worker_system_enabled(store: &Store) -> bool {
    match store.get::<crate::types::MetaEntry>(collections::META, "worker_enabled").await {
        Ok(Some(meta)) => meta.value != "0",
        _ => true,
    }
}

/// Sleeps for `dur`, or returns early (`true`) if `stop` fires first.
async fn sleep_or_stop(dur: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = stop.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::{CoordError, Result};
    use crate::types::LibraryFile;

    struct CountingPipeline {
        version: &'static str,
        calls: AtomicU32,
        fail_after: Option<u32>,
        toxic: bool,
    }

    #[async_trait]
    impl ProcessingPipeline for CountingPipeline {
        fn version(&self) -> &str {
            self.version
        }

        async fn process(&self, _file_key: &FileKey) -> Result<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(fail_after) = self.fail_after {
                if n > fail_after {
                    return if self.toxic {
                        Err(CoordError::PipelineFileFailure {
                            file_key: "x".into(),
                            source: anyhow::anyhow!("corrupt"),
                        })
                    } else {
                        Err(CoordError::PipelineSystemicFailure(anyhow::anyhow!("backend down")))
                    };
                }
            }
            Ok(serde_json::json!({}))
        }
    }

    async fn store() -> Arc<Store> {
        Arc::new(Store::connect("runtime_tests", "db").await.unwrap())
    }

    async fn seed(store: &Store, key: &str) {
        let file = LibraryFile {
            key: FileKey::new(key),
            needs_tagging: 1,
            tagged: 0,
            is_valid: 1,
            tagged_version: None,
            last_tagged_at: None,
            predictions: Default::default(),
            calibrated_tags: Default::default(),
            error: None,
        };
        store.insert(collections::LIBRARY_FILES, key, &file).await.unwrap();
    }

    fn config() -> WorkerLoopConfig {
        WorkerLoopConfig {
            job_type: "tag".into(),
            discovery_idle_interval: Duration::from_millis(5),
            max_systemic_errors: 3,
            toxic_crash_threshold: 2,
        }
    }

    #[tokio::test]
    async fn stops_when_token_cancelled_with_no_work() {
        let store = store().await;
        let stop = CancellationToken::new();
        stop.cancel();
        let exit = run_worker_loop(
            store,
            ComponentId::new("w0"),
            Arc::new(CountingPipeline { version: "v1", calls: AtomicU32::new(0), fail_after: None, toxic: false }),
            config(),
            stop,
            Arc::new(Mutex::new(None)),
        )
        .await;
        assert!(matches!(exit, WorkerExit::Stopped));
    }

    #[tokio::test]
    async fn processes_a_file_to_completion() {
        let store = store().await;
        seed(&store, "a").await;
        let stop = CancellationToken::new();
        let stop_clone = stop.clone();
        let pipeline = Arc::new(CountingPipeline { version: "v1", calls: AtomicU32::new(0), fail_after: None, toxic: false });
        let store_clone = store.clone();
        let handle = tokio::spawn(async move {
            run_worker_loop(store_clone, ComponentId::new("w0"), pipeline, config(), stop_clone, Arc::new(Mutex::new(None))).await
        });
        // give the loop a moment to claim, process, and finalize, then stop it
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        let _ = handle.await.unwrap();

        let file: LibraryFile = store.get(collections::LIBRARY_FILES, "a").await.unwrap().unwrap();
        assert_eq!(file.tagged, 1);
        assert!(!store.has(collections::WORKER_CLAIMS, &FileKey::new("a").claim_key()).await.unwrap());
    }

    #[tokio::test]
    async fn self_terminates_after_systemic_error_budget() {
        let store = store().await;
        for i in 0..10 {
            seed(&store, &format!("f{i}")).await;
        }
        let stop = CancellationToken::new();
        let pipeline = Arc::new(CountingPipeline { version: "v1", calls: AtomicU32::new(0), fail_after: Some(0), toxic: false });
        let exit = run_worker_loop(store, ComponentId::new("w0"), pipeline, config(), stop, Arc::new(Mutex::new(None))).await;
        assert!(matches!(exit, WorkerExit::SelfTerminated { .. }));
    }
}
