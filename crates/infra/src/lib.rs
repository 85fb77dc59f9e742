//! Infrastructure layer: persistence, safety rules, workers, and operator views.

pub mod backends;
pub mod claim;
pub mod config;
pub mod history;
pub mod jitter;
pub mod maintenance;
pub mod monitoring;
pub mod platform;
pub mod rate;
pub mod safety;
pub mod schema;
pub mod service;
pub mod store;
pub mod worker;

mod pg;

#[cfg(test)]
mod test_support;


pub use backends::Backends;
pub use claim::ClaimCoordinator;
pub use config::{ConfigError, ExecutorConfig, SafetyConfig};
pub use history::{EntityHistoryQuery, HistoryLog};
pub use jitter::JitterScheduler;
pub use maintenance::{Maintenance, MaintenanceReport};
pub use monitoring::{Monitor, RateLimitLevel, RateLimitStatus};
pub use platform::{PlatformClient, PlatformError};
pub use rate::{RateCheck, RateTracker};
pub use safety::{SafetyDecision, SafetyEngine};
pub use service::{EnqueueError, EnqueueReceipt, SafeExecutor, ServiceError};
pub use store::{ChangeRequestStore, QueueDepth, StoreError};
pub use worker::{ExecuteError, ExecutionOutcome, ExecutionWorker, WorkerHandle, WorkerRunner, WorkerStats};
