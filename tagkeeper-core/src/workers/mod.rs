//! Discovery Worker Pool (C4).

pub mod claim;
pub mod pipeline;
pub mod pool;
pub mod runtime;

pub use pipeline::{NoopPipeline, ProcessingPipeline};
pub use pool::{SubprocessSpawner, WorkerSystem};
pub use runtime::{run_worker_loop, CurrentJobSlot, WorkerExit, WorkerLoopConfig};
