use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Concurrent in-memory indexes. Slot contents are guarded by the per-slot
/// `RwLock`; everything else lives in lock-free maps.
pub struct Store {
    slots: DashMap<Ulid, SharedSlotState>,
    /// Reverse lookup: booking id → current slot id. Updated on reschedule.
    booking_to_slot: DashMap<Ulid, Ulid>,
    /// Student → all booking ids ever created for them (for monthly checks).
    student_bookings: DashMap<Ulid, Vec<Ulid>>,
    students: DashMap<Ulid, Student>,
    /// At most one outstanding grant per student.
    grants: DashMap<Ulid, PriorityGrant>,
    bypasses: DashMap<Ulid, MonthlyBypass>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            booking_to_slot: DashMap::new(),
            student_bookings: DashMap::new(),
            students: DashMap::new(),
            grants: DashMap::new(),
            bypasses: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn contains_slot(&self, id: &Ulid) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn insert_slot(&self, id: Ulid, state: SharedSlotState) {
        self.slots.insert(id, state);
    }

    pub fn slot_ids(&self) -> Vec<Ulid> {
        self.slots.iter().map(|e| *e.key()).collect()
    }

    // ── Students ─────────────────────────────────────────────

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    pub fn get_student(&self, id: &Ulid) -> Option<Student> {
        self.students.get(id).map(|e| *e.value())
    }

    pub fn insert_student(&self, student: Student) {
        self.students.insert(student.id, student);
    }

    pub fn students_snapshot(&self) -> Vec<Student> {
        self.students.iter().map(|e| *e.value()).collect()
    }

    // ── Booking indexes ──────────────────────────────────────

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn contains_booking(&self, booking_id: &Ulid) -> bool {
        self.booking_to_slot.contains_key(booking_id)
    }

    pub fn index_booking(&self, booking_id: Ulid, slot_id: Ulid, student_id: Ulid) {
        self.booking_to_slot.insert(booking_id, slot_id);
        self.student_bookings.entry(student_id).or_default().push(booking_id);
    }

    /// Reschedule: the booking id keeps its student index entry, only the
    /// slot mapping moves.
    pub fn reindex_booking(&self, booking_id: Ulid, new_slot_id: Ulid) {
        self.booking_to_slot.insert(booking_id, new_slot_id);
    }

    pub fn bookings_for_student(&self, student_id: &Ulid) -> Vec<Ulid> {
        self.student_bookings
            .get(student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Priority grants ──────────────────────────────────────

    pub fn get_grant(&self, student_id: &Ulid) -> Option<PriorityGrant> {
        self.grants.get(student_id).map(|e| e.value().clone())
    }

    pub fn put_grant(&self, grant: PriorityGrant) {
        self.grants.insert(grant.student_id, grant);
    }

    pub fn remove_grant(&self, student_id: &Ulid) -> Option<PriorityGrant> {
        self.grants.remove(student_id).map(|(_, g)| g)
    }

    /// Atomic check-and-delete: removes the grant only if it is unexpired.
    /// This is the single consumption point — two racing consumers cannot
    /// both obtain the grant.
    pub fn take_active_grant(&self, student_id: &Ulid, now: DateTime<Utc>) -> Option<PriorityGrant> {
        self.grants
            .remove_if(student_id, |_, g| !g.is_expired(now))
            .map(|(_, g)| g)
    }

    /// Compensating restore after a failed consume. Only lands if no newer
    /// grant has been issued meanwhile.
    pub fn restore_grant_if_absent(&self, grant: PriorityGrant) {
        self.grants.entry(grant.student_id).or_insert(grant);
    }

    pub fn grants(&self) -> Vec<PriorityGrant> {
        self.grants.iter().map(|e| e.value().clone()).collect()
    }

    // ── Monthly bypasses ─────────────────────────────────────

    pub fn get_bypass(&self, student_id: &Ulid) -> Option<MonthlyBypass> {
        self.bypasses.get(student_id).map(|e| e.value().clone())
    }

    pub fn put_bypass(&self, bypass: MonthlyBypass) {
        self.bypasses.insert(bypass.student_id, bypass);
    }

    pub fn remove_bypass(&self, student_id: &Ulid) -> Option<MonthlyBypass> {
        self.bypasses.remove(student_id).map(|(_, b)| b)
    }

    pub fn bypasses(&self) -> Vec<MonthlyBypass> {
        self.bypasses.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a slot-scoped event to slot state the caller has locked.
    pub fn apply_slot_event(&self, rs: &mut SlotState, event: &Event) {
        match event {
            Event::SlotCapacityChanged { capacity, .. } => {
                rs.capacity = *capacity;
            }
            Event::SlotDeactivated { .. } => {
                rs.active = false;
            }
            Event::BookingCreated { id, slot_id, student_id, booked_at } => {
                rs.bookings.push(Booking::confirmed(*id, *student_id, *slot_id, *booked_at));
                self.index_booking(*id, *slot_id, *student_id);
            }
            Event::BookingCancelled { id, cancelled_at, reason, .. } => {
                if let Some(b) = rs.booking_mut(*id) {
                    b.status = BookingStatus::Cancelled;
                    b.cancelled_at = Some(*cancelled_at);
                    b.cancellation_reason = Some(reason.clone());
                }
            }
            Event::AttendanceMarked { id, attended, .. } => {
                if let Some(b) = rs.booking_mut(*id) {
                    b.attended = Some(*attended);
                    b.status = if *attended {
                        BookingStatus::Completed
                    } else {
                        BookingStatus::NoShow
                    };
                }
            }
            Event::SlotBlocked { block, .. } => {
                rs.block = Some(block.clone());
            }
            Event::SlotUnblocked { .. } => {
                rs.block = None;
            }
            // Registry-level and two-slot events are routed elsewhere.
            _ => {}
        }
    }

    /// Move a booking between two slots the caller has locked. The booking
    /// keeps its identity and original `booked_at`; only the slot changes.
    pub fn apply_move(&self, from: &mut SlotState, to: &mut SlotState, booking_id: Ulid) {
        if let Some(pos) = from.bookings.iter().position(|b| b.id == booking_id) {
            let mut booking = from.bookings.remove(pos);
            booking.slot_id = to.id;
            to.bookings.push(booking);
            self.reindex_booking(booking_id, to.id);
        }
    }

    /// Apply an event that targets the registries rather than a slot.
    pub fn apply_registry_event(&self, event: &Event) {
        match event {
            Event::StudentRegistered { id, branch_id } => {
                self.insert_student(Student { id: *id, branch_id: *branch_id });
            }
            Event::GrantIssued { grant } => {
                self.put_grant(grant.clone());
            }
            Event::GrantRevoked { student_id } => {
                self.remove_grant(student_id);
            }
            Event::BypassGranted { bypass } => {
                self.put_bypass(bypass.clone());
            }
            Event::BypassRevoked { student_id } => {
                self.remove_bypass(student_id);
            }
            _ => {}
        }
    }
}
