//! Domain building blocks for the safe change executor.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! change requests and their state machine, per-change-type policy, audit
//! history records, and a clock abstraction.

pub mod change;
pub mod clock;
pub mod error;
pub mod history;
pub mod id;
pub mod policy;
pub mod status;

pub use change::{
    ChangeRequest, ChangeType, ChangeValue, DEFAULT_JITTER_MAX_MS, DEFAULT_JITTER_MIN_MS,
    EntityStatus, EntityType, MAX_JITTER_MS, NewChangeRequest, percentage_change,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use history::{BlockReason, FailureKind, HistoryRecord, SafetyCheckResult};
pub use id::{ChangeRequestId, TenantId, WorkerId};
pub use policy::{JobTypeConfig, PolicyBook};
pub use status::{ChangeStatus, Transition};
