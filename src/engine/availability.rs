use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{SlotAvailability, SlotState};

// ── Availability Calculator ──────────────────────────────────────
//
// Remaining capacity is re-derived from booking statuses on every call;
// nothing here is cached, because concurrent bookings change the counts
// between requests.

/// Slot selection criteria. All fields are conjunctive; `None` matches all.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityFilter {
    pub branch_id: Option<Ulid>,
    pub teacher_id: Option<Ulid>,
    /// Inclusive calendar-day range.
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Admin tooling: also emit fully-booked and blocked slots.
    pub include_full: bool,
}

impl AvailabilityFilter {
    pub fn matches(&self, s: &SlotState) -> bool {
        if !s.active {
            return false;
        }
        if let Some(b) = self.branch_id
            && s.branch_id != b {
                return false;
            }
        if let Some(t) = self.teacher_id
            && s.teacher_id != t {
                return false;
            }
        if let Some(from) = self.from
            && s.date < from {
                return false;
            }
        if let Some(to) = self.to
            && s.date > to {
                return false;
            }
        true
    }
}

/// Project one slot into its availability view.
pub fn slot_availability(s: &SlotState) -> SlotAvailability {
    let booked = s.booked_count();
    SlotAvailability {
        slot_id: s.id,
        teacher_id: s.teacher_id,
        branch_id: s.branch_id,
        date: s.date,
        start_time: s.start_time,
        end_time: s.end_time,
        capacity: s.capacity,
        booked_count: booked,
        available_spots: s.capacity.saturating_sub(booked),
        blocked: s.block.is_some(),
    }
}

/// Default view hides full and blocked slots; `include_full` shows everything.
pub fn visible(entry: &SlotAvailability, include_full: bool) -> bool {
    include_full || (entry.available_spots > 0 && !entry.blocked)
}

/// Deterministic ordering: ascending `(date, start_time)`, slot id as the
/// tie-break for identical times.
pub fn sort_entries(entries: &mut [SlotAvailability]) {
    entries.sort_by(|a, b| {
        (a.date, a.start_time, a.slot_id).cmp(&(b.date, b.start_time, b.slot_id))
    });
}
