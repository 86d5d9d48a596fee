/// Worker pool spawning and shutdown.
pub mod pool;
/// Job processing hook and the simulated processor.
pub mod processor;
/// Cooperative shutdown signalling.
pub mod shutdown;
/// Per-worker consume loop.
pub mod worker;

pub use pool::{PoolReport, WorkerPool, WORKER_SHUTDOWN_TIMEOUT};
pub use processor::{JobProcessor, ProcessOutcome, SimulatedProcessor};
pub use shutdown::ShutdownToken;
pub use worker::{WorkerReport, WorkerState};
