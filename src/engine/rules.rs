//! Pure business-rule predicates. Each rule inspects a pre-gathered context
//! and either passes or names its violation; no rule touches storage.

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, Utc};
use ulid::Ulid;

use crate::model::SlotBlock;

/// A named rule violation with enough detail to render a precise message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    PastSlotBooking,
    SlotBlocked { reason: String },
    SlotCapacityExceeded { booked: u32, capacity: u32 },
    DuplicateBooking,
    CrossBranchDisabled,
    MonthlyBookingLimit { count: u32, limit: u32 },
    CancellationTimeLimit { hours_required: i64 },
}

impl RuleViolation {
    /// Stable error code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            RuleViolation::PastSlotBooking => "PAST_SLOT_BOOKING",
            RuleViolation::SlotBlocked { .. } => "SLOT_BLOCKED",
            RuleViolation::SlotCapacityExceeded { .. } => "SLOT_CAPACITY_EXCEEDED",
            RuleViolation::DuplicateBooking => "DUPLICATE_BOOKING",
            RuleViolation::CrossBranchDisabled => "CROSS_BRANCH_DISABLED",
            RuleViolation::MonthlyBookingLimit { .. } => "MONTHLY_BOOKING_LIMIT",
            RuleViolation::CancellationTimeLimit { .. } => "CANCELLATION_TIME_LIMIT",
        }
    }
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleViolation::PastSlotBooking => write!(f, "slot start time is in the past"),
            RuleViolation::SlotBlocked { reason } => write!(f, "slot is blocked: {reason}"),
            RuleViolation::SlotCapacityExceeded { booked, capacity } => {
                write!(f, "slot is full ({booked}/{capacity})")
            }
            RuleViolation::DuplicateBooking => {
                write!(f, "student already has an active booking on this slot")
            }
            RuleViolation::CrossBranchDisabled => {
                write!(f, "cross-branch booking is disabled")
            }
            RuleViolation::MonthlyBookingLimit { count, limit } => {
                write!(f, "monthly booking limit reached ({count}/{limit})")
            }
            RuleViolation::CancellationTimeLimit { hours_required } => {
                write!(f, "cancellations require at least {hours_required}h notice")
            }
        }
    }
}

// ── Individual rules ─────────────────────────────────────────────

pub fn not_in_past(slot_start: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), RuleViolation> {
    if slot_start < now {
        return Err(RuleViolation::PastSlotBooking);
    }
    Ok(())
}

pub fn slot_not_blocked(block: Option<&SlotBlock>) -> Result<(), RuleViolation> {
    if let Some(b) = block {
        return Err(RuleViolation::SlotBlocked { reason: b.reason.clone() });
    }
    Ok(())
}

pub fn capacity_available(booked: u32, capacity: u32) -> Result<(), RuleViolation> {
    if booked >= capacity {
        return Err(RuleViolation::SlotCapacityExceeded { booked, capacity });
    }
    Ok(())
}

pub fn no_duplicate(has_active_duplicate: bool) -> Result<(), RuleViolation> {
    if has_active_duplicate {
        return Err(RuleViolation::DuplicateBooking);
    }
    Ok(())
}

pub fn cross_branch_allowed(
    student_branch: Ulid,
    slot_branch: Ulid,
    allow_cross_branch: bool,
) -> Result<(), RuleViolation> {
    if student_branch != slot_branch && !allow_cross_branch {
        return Err(RuleViolation::CrossBranchDisabled);
    }
    Ok(())
}

pub fn monthly_limit(count: u32, limit: u32, has_bypass: bool) -> Result<(), RuleViolation> {
    if !has_bypass && count >= limit {
        return Err(RuleViolation::MonthlyBookingLimit { count, limit });
    }
    Ok(())
}

/// Student cancellations/reschedules need `cancellation_hours` of notice.
/// Exactly `cancellation_hours` before start still passes; one second less
/// does not. Staff and override callers never reach this rule.
pub fn cancellation_window(
    slot_start: DateTime<Utc>,
    now: DateTime<Utc>,
    cancellation_hours: i64,
) -> Result<(), RuleViolation> {
    if slot_start - now < Duration::hours(cancellation_hours) {
        return Err(RuleViolation::CancellationTimeLimit { hours_required: cancellation_hours });
    }
    Ok(())
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Calendar-month equality (Jan 1–31 style boundaries).
pub fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Inclusive `[first_day, last_day]` of the month containing `d`.
pub fn month_bounds(d: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first = d.with_day(1).expect("day 1 always valid");
    let last = first + Months::new(1) - Days::new(1);
    (first, last)
}

// ── Composition ──────────────────────────────────────────────────

/// Everything the create/reschedule admission sequence needs, gathered by
/// the engine before the rules run.
#[derive(Debug)]
pub struct AdmissionContext<'a> {
    pub now: DateTime<Utc>,
    pub slot_start: DateTime<Utc>,
    pub block: Option<&'a SlotBlock>,
    pub booked: u32,
    pub capacity: u32,
    pub duplicate: bool,
    pub student_branch: Ulid,
    pub slot_branch: Ulid,
    pub allow_cross_branch: bool,
    pub monthly_count: u32,
    pub monthly_limit: u32,
    pub has_bypass: bool,
}

/// Canonical rule order, short-circuiting on the first violation:
/// NotInPast → SlotNotBlocked → CapacityAvailable → NoDuplicateBooking →
/// CrossBranchAllowed → MonthlyLimit.
pub fn check_admission(ctx: &AdmissionContext<'_>) -> Result<(), RuleViolation> {
    not_in_past(ctx.slot_start, ctx.now)?;
    slot_not_blocked(ctx.block)?;
    capacity_available(ctx.booked, ctx.capacity)?;
    no_duplicate(ctx.duplicate)?;
    cross_branch_allowed(ctx.student_branch, ctx.slot_branch, ctx.allow_cross_branch)?;
    monthly_limit(ctx.monthly_count, ctx.monthly_limit, ctx.has_bypass)?;
    Ok(())
}
