//! In-memory tutoring-slot booking engine: capacity-limited slots, a
//! booking state machine, admission rules (cancellation windows, monthly
//! caps, cross-branch policy), priority reschedule grants, audited
//! administrative overrides, and an event-sourced WAL for durability.

pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod wal;

pub use auth::{AuthContext, Role};
pub use config::SystemConfig;
pub use engine::{AvailabilityFilter, Engine, EngineError, RuleViolation};
pub use model::{
    Booking, BookingStatus, CancelOutcome, MonthlyBypass, PriorityGrant, SlotAvailability,
    SlotCancellationReport, SlotInfo, Student,
};
pub use notify::{Notification, Notifier, NotifyHub};
