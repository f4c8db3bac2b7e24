use chrono::Utc;
use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_DAYS;
use crate::model::*;

use super::availability::{self, AvailabilityFilter};
use super::{Engine, EngineError};

fn slot_info(s: &SlotState) -> SlotInfo {
    SlotInfo {
        id: s.id,
        teacher_id: s.teacher_id,
        branch_id: s.branch_id,
        date: s.date,
        start_time: s.start_time,
        end_time: s.end_time,
        capacity: s.capacity,
        active: s.active,
        blocked: s.block.is_some(),
    }
}

impl Engine {
    /// Search bookable slots. Remaining capacity is derived from booking
    /// statuses at read time; results come back ordered by `(date, time)`.
    pub async fn availability(
        &self,
        filter: &AvailabilityFilter,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(EngineError::Validation("date range is inverted"));
            }
            if (to - from).num_days() > MAX_QUERY_WINDOW_DAYS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }

        let mut entries = Vec::new();
        for slot_id in self.store().slot_ids() {
            let Some(rs) = self.store().get_slot(&slot_id) else { continue };
            let guard = rs.read().await;
            if !filter.matches(&guard) {
                continue;
            }
            let entry = availability::slot_availability(&guard);
            if availability::visible(&entry, filter.include_full) {
                entries.push(entry);
            }
        }
        availability::sort_entries(&mut entries);
        Ok(entries)
    }

    /// Slots a grant holder can redeem into: open future slots, restricted
    /// to the cancelled slot's branch when cross-branch booking is off.
    pub async fn replacement_pool(
        &self,
        student_id: &Ulid,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let grant = self
            .priority_grant(student_id)
            .ok_or(EngineError::NoActiveGrant(*student_id))?;
        let branch_id =
            (!self.config().allow_cross_branch_booking).then_some(grant.branch_id);
        let filter = AvailabilityFilter {
            branch_id,
            from: Some(Utc::now().date_naive()),
            ..Default::default()
        };
        self.availability(&filter).await
    }

    /// The student's outstanding grant, if any. Expired grants read as
    /// absent; the background sweep deletes them later.
    pub fn priority_grant(&self, student_id: &Ulid) -> Option<PriorityGrant> {
        self.store()
            .get_grant(student_id)
            .filter(|g| !g.is_expired(Utc::now()))
    }

    /// The student's monthly-limit bypass, if any and unexpired.
    pub fn monthly_bypass(&self, student_id: &Ulid) -> Option<MonthlyBypass> {
        self.store()
            .get_bypass(student_id)
            .filter(|b| !b.is_expired(Utc::now()))
    }

    pub async fn get_slot(&self, slot_id: &Ulid) -> Result<SlotInfo, EngineError> {
        let rs = self.store().get_slot(slot_id).ok_or(EngineError::NotFound(*slot_id))?;
        let guard = rs.read().await;
        Ok(slot_info(&guard))
    }

    pub async fn get_booking(&self, booking_id: &Ulid) -> Result<Booking, EngineError> {
        let slot_id = self
            .store()
            .slot_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        guard
            .booking(*booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// All bookings for a student, any status, newest first.
    pub async fn student_bookings(&self, student_id: &Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for booking_id in self.store().bookings_for_student(student_id) {
            let Some(slot_id) = self.store().slot_for_booking(&booking_id) else { continue };
            let Some(rs) = self.store().get_slot(&slot_id) else { continue };
            let guard = rs.read().await;
            if let Some(b) = guard.booking(booking_id) {
                out.push(b.clone());
            }
        }
        out.sort_by(|a, b| b.booked_at.cmp(&a.booked_at));
        out
    }

    /// Full booking history of one slot, in insertion order.
    pub async fn slot_bookings(&self, slot_id: &Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self.store().get_slot(slot_id).ok_or(EngineError::NotFound(*slot_id))?;
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    /// Every slot the engine holds, active or not. Admin tooling.
    pub async fn list_slots(&self) -> Vec<SlotInfo> {
        let mut out = Vec::new();
        for slot_id in self.store().slot_ids() {
            let Some(rs) = self.store().get_slot(&slot_id) else { continue };
            let guard = rs.read().await;
            out.push(slot_info(&guard));
        }
        out.sort_by(|a, b| (a.date, a.start_time, a.id).cmp(&(b.date, b.start_time, b.id)));
        out
    }
}
