use ulid::Ulid;

use super::rules::RuleViolation;
use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A business rule rejected the operation. Carries structured detail.
    Rule(RuleViolation),
    /// Transition attempted from a terminal booking state.
    InvalidBookingStatus { id: Ulid, status: BookingStatus },
    /// No unexpired priority grant exists for the student (or it was
    /// consumed by a concurrent request).
    NoActiveGrant(Ulid),
    Unauthorized(&'static str),
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Rule(v) => write!(f, "{}: {v}", v.code()),
            EngineError::InvalidBookingStatus { id, status } => {
                write!(f, "INVALID_BOOKING_STATUS: booking {id} is {status}")
            }
            EngineError::NoActiveGrant(student_id) => {
                write!(f, "no active priority grant for student {student_id}")
            }
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RuleViolation> for EngineError {
    fn from(v: RuleViolation) -> Self {
        EngineError::Rule(v)
    }
}
