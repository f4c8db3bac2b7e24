use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Lifecycle status of a booking. `Confirmed` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Active bookings occupy a seat and count toward the monthly limit.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Completed)
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Confirmed)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::NoShow => "NO_SHOW",
        };
        f.write_str(s)
    }
}

/// A student's reservation against a slot. Never physically deleted —
/// cancellation is a status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub student_id: Ulid,
    pub slot_id: Ulid,
    pub status: BookingStatus,
    pub booked_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub attended: Option<bool>,
}

impl Booking {
    pub fn confirmed(id: Ulid, student_id: Ulid, slot_id: Ulid, booked_at: DateTime<Utc>) -> Self {
        Self {
            id,
            student_id,
            slot_id,
            status: BookingStatus::Confirmed,
            booked_at,
            cancelled_at: None,
            cancellation_reason: None,
            attended: None,
        }
    }
}

/// Punitive hold on a slot created by a late cancellation. Removable only
/// through the administrative unblock path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBlock {
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub blocked_by: Ulid,
    pub original_booking_id: Option<Ulid>,
}

/// Time-boxed entitlement issued when a teacher cancels a slot out from
/// under a student. At most one outstanding grant per student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityGrant {
    pub student_id: Ulid,
    pub original_slot_id: Ulid,
    pub original_booking_id: Ulid,
    pub branch_id: Ulid,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PriorityGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Administrative suppression of the monthly-limit rule for one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyBypass {
    pub student_id: Ulid,
    pub reason: String,
    pub granted_by: Ulid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MonthlyBypass {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Student registry entry. The home branch drives the cross-branch rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: Ulid,
    pub branch_id: Ulid,
}

/// One bookable slot plus its full booking history and optional block.
/// `booked_count` is always derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub branch_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub active: bool,
    pub bookings: Vec<Booking>,
    pub block: Option<SlotBlock>,
}

impl SlotState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Ulid,
        teacher_id: Ulid,
        branch_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
    ) -> Self {
        Self {
            id,
            teacher_id,
            branch_id,
            date,
            start_time,
            end_time,
            capacity,
            active: true,
            bookings: Vec::new(),
            block: None,
        }
    }

    /// Slot times are naive local wall-clock values interpreted as UTC.
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.start_time).and_utc()
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.end_time).and_utc()
    }

    /// Seats occupied by CONFIRMED or COMPLETED bookings.
    pub fn booked_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.status.is_active()).count() as u32
    }

    pub fn available_spots(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count())
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// The at-most-one active booking this student holds on the slot.
    pub fn active_booking_for(&self, student_id: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.student_id == student_id && b.status.is_active())
    }

    /// Ids of all CONFIRMED bookings, in insertion order.
    pub fn confirmed_booking_ids(&self) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .map(|b| b.id)
            .collect()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        teacher_id: Ulid,
        branch_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
    },
    SlotCapacityChanged {
        id: Ulid,
        capacity: u32,
    },
    SlotDeactivated {
        id: Ulid,
    },
    StudentRegistered {
        id: Ulid,
        branch_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        slot_id: Ulid,
        student_id: Ulid,
        booked_at: DateTime<Utc>,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        cancelled_at: DateTime<Utc>,
        reason: String,
    },
    BookingMoved {
        id: Ulid,
        from_slot_id: Ulid,
        to_slot_id: Ulid,
        moved_at: DateTime<Utc>,
    },
    AttendanceMarked {
        id: Ulid,
        slot_id: Ulid,
        attended: bool,
    },
    SlotBlocked {
        slot_id: Ulid,
        block: SlotBlock,
    },
    SlotUnblocked {
        slot_id: Ulid,
    },
    GrantIssued {
        grant: PriorityGrant,
    },
    GrantRevoked {
        student_id: Ulid,
    },
    BypassGranted {
        bypass: MonthlyBypass,
    },
    BypassRevoked {
        student_id: Ulid,
    },
}

/// Extract the slot id an event applies to, for replay routing.
/// Registry-level events (students, grants, bypasses, slot creation) and the
/// two-slot move event return None and are routed explicitly.
pub fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotCapacityChanged { id, .. } | Event::SlotDeactivated { id } => Some(*id),
        Event::BookingCreated { slot_id, .. }
        | Event::BookingCancelled { slot_id, .. }
        | Event::AttendanceMarked { slot_id, .. }
        | Event::SlotBlocked { slot_id, .. }
        | Event::SlotUnblocked { slot_id } => Some(*slot_id),
        Event::SlotCreated { .. }
        | Event::StudentRegistered { .. }
        | Event::BookingMoved { .. }
        | Event::GrantIssued { .. }
        | Event::GrantRevoked { .. }
        | Event::BypassGranted { .. }
        | Event::BypassRevoked { .. } => None,
    }
}

// ── Query result types ───────────────────────────────────────────

/// Remaining capacity of one slot, re-derived on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAvailability {
    pub slot_id: Ulid,
    pub teacher_id: Ulid,
    pub branch_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub booked_count: u32,
    pub available_spots: u32,
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub branch_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub active: bool,
    pub blocked: bool,
}

/// Result of cancelling a single booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    /// True when a student cancelled inside the window and the slot got blocked.
    pub late_cancellation: bool,
}

/// Partial-success report for a bulk teacher cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCancellationReport {
    pub attempted: usize,
    pub cancelled: usize,
    pub grants_issued: usize,
}
