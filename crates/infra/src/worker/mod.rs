//! Claimed-request execution and the polling loop around it.

pub mod execute;
pub mod runner;

pub use execute::{ExecuteError, ExecutionOutcome, ExecutionWorker};
pub use runner::{WorkerHandle, WorkerRunner, WorkerStats};
