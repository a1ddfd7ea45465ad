//! Discovery worker subprocess.
//!
//! Spawned by `SubprocessSpawner` (in `tagkeeper-core::workers::pool`) with
//! `--component-id`, `--namespace`, and `--database`. Opens its own handle
//! to the document store, runs the claim/process/finalize loop on the
//! tokio runtime, and emits heartbeat frames over stdout from a dedicated
//! OS thread so a stalled async loop still stops heartbeating on schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tagkeeper_config::cli::CommonArgs;
use tagkeeper_core::health::heartbeat::HeartbeatFrame;
use tagkeeper_core::store::Store;
use tagkeeper_core::workers::{run_worker_loop, CurrentJobSlot, NoopPipeline, WorkerExit, WorkerLoopConfig};

#[derive(Debug, Parser)]
#[command(name = "tagkeeper-worker", about = "Discovery worker subprocess")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Component id this process was registered under; stable across restarts.
    #[arg(long)]
    component_id: String,

    /// Document store namespace to reconnect to.
    #[arg(long)]
    namespace: String,

    /// Document store database to reconnect to.
    #[arg(long)]
    database: String,

    /// Job type this worker discovers and claims.
    #[arg(long, default_value = "tag")]
    job_type: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tagkeeper_config::cli::init_tracing(args.common.json_logs);

    let config = tagkeeper_config::load(args.common.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: tagkeeper_config::CoordinatorConfig) -> anyhow::Result<()> {
    let component_id = tagkeeper_core::types::ComponentId::new(args.component_id.clone());
    let store = Arc::new(Store::connect(&args.namespace, &args.database).await?);

    let stop = CancellationToken::new();
    let current_job: CurrentJobSlot = Arc::new(Mutex::new(None));
    register_shutdown_signals(stop.clone());

    let heartbeat_handle = spawn_heartbeat_thread(current_job.clone(), stop.clone());

    let loop_config = WorkerLoopConfig {
        job_type: args.job_type,
        discovery_idle_interval: Duration::from_millis(config.worker_pool.discovery_idle_interval_ms),
        max_systemic_errors: config.worker_pool.max_systemic_errors,
        toxic_crash_threshold: config.worker_pool.toxic_crash_threshold,
    };

    info!(component_id = %component_id, "worker starting");
    let pipeline = Arc::new(NoopPipeline::new("v0"));
    let exit = run_worker_loop(store, component_id.clone(), pipeline, loop_config, stop.clone(), current_job).await;

    stop.cancel();
    let _ = heartbeat_handle.join();

    match exit {
        WorkerExit::Stopped => {
            info!(component_id = %component_id, "worker stopped cleanly");
            Ok(())
        }
        WorkerExit::SelfTerminated { reason } => {
            error!(component_id = %component_id, reason, "worker self-terminating");
            std::process::exit(1);
        }
    }
}

/// Registers SIGTERM/SIGINT handlers that flip a shared flag and cancel
/// the stop token. Mirrors the flag-based registration pattern used
/// elsewhere in the pack's daemon code, which polls rather than blocking
/// on signal delivery.
fn register_shutdown_signals(stop: CancellationToken) {
    let flag = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(SIGTERM, flag.clone()) {
        warn!(error = %e, "failed to register SIGTERM handler");
    }
    if let Err(e) = signal_hook::flag::register(SIGINT, flag.clone()) {
        warn!(error = %e, "failed to register SIGINT handler");
    }
    std::thread::spawn(move || loop {
        if flag.load(Ordering::Relaxed) {
            stop.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    });
}

/// Emits `{status: "healthy", pid, current_job}` every 5 s on its own OS
/// thread, and `{status: "stopping"}` once `stop` fires, then closes
/// stdout by returning. Runs independently of the tokio runtime so a
/// wedged processing loop still stops heartbeating on schedule.
fn spawn_heartbeat_thread(current_job: CurrentJobSlot, stop: CancellationToken) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        use std::io::Write;
        let pid = std::process::id();
        let mut stdout = std::io::stdout();
        loop {
            if stop.is_cancelled() {
                if let Ok(line) = HeartbeatFrame::stopping().encode() {
                    let _ = writeln!(stdout, "{line}");
                }
                return;
            }
            let job = current_job.lock().unwrap().clone();
            if let Ok(line) = HeartbeatFrame::healthy(pid, job).encode() {
                if writeln!(stdout, "{line}").is_err() {
                    return;
                }
                let _ = stdout.flush();
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    })
}
