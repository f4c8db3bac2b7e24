use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::audit::AuditOutcome;
use crate::auth::{AuthContext, Role};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::rules::{self, AdmissionContext};
use super::{Engine, EngineError};

const LATE_CANCEL_BLOCK_REASON: &str = "Late cancellation";

fn validate_reason(reason: &str) -> Result<(), EngineError> {
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

/// Who may act on a single booking: its student, the slot's own teacher, or
/// an admin administering the slot's branch. BranchAdmins outside the branch
/// see the booking as missing.
fn authorize_booking_actor(
    ctx: &AuthContext,
    student_id: Ulid,
    slot: &SlotState,
    booking_id: Ulid,
) -> Result<(), EngineError> {
    match ctx.role {
        Role::Student => {
            if ctx.user_id != student_id {
                return Err(EngineError::Unauthorized("not this booking's student"));
            }
        }
        Role::Teacher => {
            if ctx.user_id != slot.teacher_id {
                return Err(EngineError::Unauthorized("not this slot's teacher"));
            }
        }
        Role::BranchAdmin | Role::SuperAdmin => {
            if !ctx.administers_branch(slot.branch_id) {
                return Err(EngineError::NotFound(booking_id));
            }
        }
    }
    Ok(())
}

impl Engine {
    // ── Registry ─────────────────────────────────────────────

    pub async fn register_student(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        branch_id: Ulid,
    ) -> Result<(), EngineError> {
        if !ctx.is_admin() {
            return Err(EngineError::Unauthorized("admin role required"));
        }
        if self.store().student_count() >= MAX_STUDENTS {
            return Err(EngineError::LimitExceeded("too many students"));
        }
        if self.store().get_student(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_registry(&Event::StudentRegistered { id, branch_id }).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_slot(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        teacher_id: Ulid,
        branch_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: u32,
    ) -> Result<(), EngineError> {
        let owning_teacher = ctx.role == Role::Teacher && ctx.user_id == teacher_id;
        if !owning_teacher && !ctx.administers_branch(branch_id) {
            return Err(EngineError::Unauthorized("not this slot's teacher or branch admin"));
        }
        if end_time <= start_time {
            return Err(EngineError::Validation("slot end must be after start"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be positive"));
        }
        if capacity > MAX_SLOT_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if self.store().slot_count() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if self.store().contains_slot(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SlotCreated {
            id,
            teacher_id,
            branch_id,
            date,
            start_time,
            end_time,
            capacity,
        };
        self.wal_append(&event).await?;
        let rs = SlotState::new(id, teacher_id, branch_id, date, start_time, end_time, capacity);
        self.store().insert_slot(id, Arc::new(RwLock::new(rs)));
        metrics::gauge!(observability::SLOTS_ACTIVE).increment(1.0);
        Ok(())
    }

    /// Capacity can grow freely but may never drop below the current number
    /// of seated bookings.
    pub async fn set_slot_capacity(
        &self,
        ctx: &AuthContext,
        slot_id: Ulid,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be positive"));
        }
        if capacity > MAX_SLOT_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;
        self.authorize_admin(ctx, guard.branch_id, slot_id)?;
        if capacity < guard.booked_count() {
            return Err(EngineError::Validation("capacity below current booking count"));
        }
        let event = Event::SlotCapacityChanged { id: slot_id, capacity };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Take a slot out of circulation. Existing bookings are untouched;
    /// the slot just stops matching availability queries.
    pub async fn deactivate_slot(&self, ctx: &AuthContext, slot_id: Ulid) -> Result<(), EngineError> {
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;
        self.authorize_admin(ctx, guard.branch_id, slot_id)?;
        if !guard.active {
            return Err(EngineError::Validation("slot already deactivated"));
        }
        let event = Event::SlotDeactivated { id: slot_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// Book one seat. `booking_id` is caller-generated and doubles as the
    /// idempotency key: retrying a committed booking returns Ok without a
    /// second seat.
    pub async fn create_booking(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
    ) -> Result<(), EngineError> {
        if ctx.role == Role::Student && ctx.user_id != student_id {
            return Err(EngineError::Unauthorized("students may only book for themselves"));
        }
        let config = self.config();
        let now = Utc::now();

        let student = self
            .store()
            .get_student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;

        if self.store().contains_booking(&booking_id) {
            return self.check_idempotent_replay(booking_id, student_id, slot_id).await;
        }

        // Month the booking counts toward, and the student's standing in it.
        // Gathered before the target lock; other slots take read locks only.
        let slot_date = rs.read().await.date;
        let monthly_count = self.monthly_active_count(student_id, slot_date, None).await;
        let has_bypass = self
            .store()
            .get_bypass(&student_id)
            .is_some_and(|b| !b.is_expired(now));

        let mut guard = rs.write().await;
        if !guard.active {
            return Err(EngineError::NotFound(slot_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        let admission = AdmissionContext {
            now,
            slot_start: guard.starts_at(),
            block: guard.block.as_ref(),
            booked: guard.booked_count(),
            capacity: guard.capacity,
            duplicate: guard.active_booking_for(student_id).is_some(),
            student_branch: student.branch_id,
            slot_branch: guard.branch_id,
            allow_cross_branch: config.allow_cross_branch_booking,
            monthly_count,
            monthly_limit: config.max_bookings_per_month,
            has_bypass,
        };
        if let Err(v) = rules::check_admission(&admission) {
            metrics::counter!(observability::RULE_VIOLATIONS_TOTAL, "rule" => v.code())
                .increment(1);
            metrics::counter!(observability::BOOKING_OPS_TOTAL, "op" => "create", "status" => "rejected")
                .increment(1);
            return Err(v.into());
        }

        let event = Event::BookingCreated { id: booking_id, slot_id, student_id, booked_at: now };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::BOOKING_OPS_TOTAL, "op" => "create", "status" => "ok")
            .increment(1);
        self.notify_out(Notification::BookingConfirmed { booking_id, slot_id, student_id });
        Ok(())
    }

    /// A booking id is already indexed: succeed only if it is the same
    /// committed booking the caller is retrying.
    async fn check_idempotent_replay(
        &self,
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
    ) -> Result<(), EngineError> {
        if let Some(existing_slot) = self.store().slot_for_booking(&booking_id)
            && existing_slot == slot_id
            && let Some(rs) = self.store().get_slot(&existing_slot)
        {
            let guard = rs.read().await;
            if let Some(b) = guard.booking(booking_id)
                && b.student_id == student_id
                && b.status == BookingStatus::Confirmed
            {
                return Ok(());
            }
        }
        Err(EngineError::AlreadyExists(booking_id))
    }

    /// Cancel a booking. Students cancelling inside the notice window still
    /// cancel, but the slot is blocked as a penalty until an admin clears it.
    /// Staff cancellations never block.
    pub async fn cancel_booking(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        reason: impl Into<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let reason = reason.into();
        validate_reason(&reason)?;
        let config = self.config();
        let now = Utc::now();

        let (slot_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let booking = guard.booking(booking_id).ok_or(EngineError::NotFound(booking_id))?;
        authorize_booking_actor(ctx, booking.student_id, &guard, booking_id)?;
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidBookingStatus { id: booking_id, status: booking.status });
        }
        let student_id = booking.student_id;

        let late = ctx.role == Role::Student
            && rules::cancellation_window(guard.starts_at(), now, config.cancellation_hours)
                .is_err();

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            cancelled_at: now,
            reason: reason.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if late && guard.block.is_none() {
            let block = SlotBlock {
                reason: LATE_CANCEL_BLOCK_REASON.into(),
                blocked_at: now,
                blocked_by: ctx.user_id,
                original_booking_id: Some(booking_id),
            };
            self.persist_and_apply(&mut guard, &Event::SlotBlocked { slot_id, block }).await?;
        }
        drop(guard);

        metrics::counter!(observability::BOOKING_OPS_TOTAL, "op" => "cancel", "status" => "ok")
            .increment(1);
        self.notify_out(Notification::BookingCancelled { booking_id, slot_id, student_id, reason });
        Ok(CancelOutcome { booking_id, slot_id, late_cancellation: late })
    }

    /// Move a confirmed booking to another slot, keeping its identity. The
    /// admission rules run against the target; students additionally need
    /// the full notice window on the slot they are leaving.
    pub async fn reschedule_booking(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        new_slot_id: Ulid,
    ) -> Result<(), EngineError> {
        let config = self.config();
        let now = Utc::now();

        let old_slot_id = self
            .store()
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if old_slot_id == new_slot_id {
            return Err(EngineError::Validation("cannot reschedule to the same slot"));
        }
        let old_rs = self.store().get_slot(&old_slot_id).ok_or(EngineError::NotFound(old_slot_id))?;
        let new_rs = self.store().get_slot(&new_slot_id).ok_or(EngineError::NotFound(new_slot_id))?;

        // Month standing, with the moved booking excluded: moving a booking
        // never counts it against itself.
        let new_slot_date = new_rs.read().await.date;
        let student_probe = {
            let g = old_rs.read().await;
            g.booking(booking_id).map(|b| b.student_id)
        }
        .ok_or(EngineError::NotFound(booking_id))?;
        let monthly_count = self
            .monthly_active_count(student_probe, new_slot_date, Some(booking_id))
            .await;
        let has_bypass = self
            .store()
            .get_bypass(&student_probe)
            .is_some_and(|b| !b.is_expired(now));

        // Acquire write locks in sorted order to prevent deadlocks.
        let (mut old_guard, mut new_guard) = if old_slot_id < new_slot_id {
            let a = old_rs.write_owned().await;
            let b = new_rs.write_owned().await;
            (a, b)
        } else {
            let b = new_rs.write_owned().await;
            let a = old_rs.write_owned().await;
            (a, b)
        };

        let booking = old_guard.booking(booking_id).ok_or(EngineError::NotFound(booking_id))?;
        authorize_booking_actor(ctx, booking.student_id, &old_guard, booking_id)?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidBookingStatus { id: booking_id, status: booking.status });
        }
        let student_id = booking.student_id;
        let student = self
            .store()
            .get_student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;

        if ctx.role == Role::Student {
            rules::cancellation_window(old_guard.starts_at(), now, config.cancellation_hours)?;
        }
        if !new_guard.active {
            return Err(EngineError::NotFound(new_slot_id));
        }
        if new_guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        let admission = AdmissionContext {
            now,
            slot_start: new_guard.starts_at(),
            block: new_guard.block.as_ref(),
            booked: new_guard.booked_count(),
            capacity: new_guard.capacity,
            duplicate: new_guard.active_booking_for(student_id).is_some(),
            student_branch: student.branch_id,
            slot_branch: new_guard.branch_id,
            allow_cross_branch: config.allow_cross_branch_booking,
            monthly_count,
            monthly_limit: config.max_bookings_per_month,
            has_bypass,
        };
        if let Err(v) = rules::check_admission(&admission) {
            metrics::counter!(observability::RULE_VIOLATIONS_TOTAL, "rule" => v.code())
                .increment(1);
            metrics::counter!(observability::BOOKING_OPS_TOTAL, "op" => "reschedule", "status" => "rejected")
                .increment(1);
            return Err(v.into());
        }

        let event = Event::BookingMoved {
            id: booking_id,
            from_slot_id: old_slot_id,
            to_slot_id: new_slot_id,
            moved_at: now,
        };
        self.wal_append(&event).await?;
        self.store().apply_move(&mut old_guard, &mut new_guard, booking_id);
        drop(old_guard);
        drop(new_guard);

        metrics::counter!(observability::BOOKING_OPS_TOTAL, "op" => "reschedule", "status" => "ok")
            .increment(1);
        self.notify_out(Notification::BookingConfirmed {
            booking_id,
            slot_id: new_slot_id,
            student_id,
        });
        Ok(())
    }

    /// Record attendance for a confirmed booking, moving it to its terminal
    /// COMPLETED or NO_SHOW state.
    pub async fn mark_attendance(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        attended: bool,
    ) -> Result<(), EngineError> {
        let (slot_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let owning_teacher = ctx.role == Role::Teacher && guard.teacher_id == ctx.user_id;
        if !owning_teacher && !ctx.administers_branch(guard.branch_id) {
            return Err(EngineError::Unauthorized("not this slot's teacher or branch admin"));
        }
        let booking = guard.booking(booking_id).ok_or(EngineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidBookingStatus { id: booking_id, status: booking.status });
        }
        let event = Event::AttendanceMarked { id: booking_id, slot_id, attended };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Teacher slot cancellation ────────────────────────────

    /// Cancel a whole slot: every confirmed booking is cancelled and, when
    /// `offer_priority` is set, its student receives a priority-reschedule
    /// grant. The slot is then deactivated. Partial success is possible if
    /// the WAL fails mid-way; the report says how far it got.
    pub async fn cancel_slot(
        &self,
        ctx: &AuthContext,
        slot_id: Ulid,
        reason: impl Into<String>,
        offer_priority: bool,
    ) -> Result<SlotCancellationReport, EngineError> {
        let reason = reason.into();
        validate_reason(&reason)?;
        let config = self.config();
        let now = Utc::now();

        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;
        let owning_teacher = ctx.role == Role::Teacher && guard.teacher_id == ctx.user_id;
        if !owning_teacher && !ctx.administers_branch(guard.branch_id) {
            return Err(EngineError::Unauthorized("not this slot's teacher or branch admin"));
        }

        let confirmed = guard.confirmed_booking_ids();
        let mut report = SlotCancellationReport { attempted: confirmed.len(), ..Default::default() };
        let mut students = Vec::with_capacity(confirmed.len());
        let mut grants = Vec::new();

        for booking_id in confirmed {
            let Some(booking) = guard.booking(booking_id) else { continue };
            let student_id = booking.student_id;
            let cancel = Event::BookingCancelled {
                id: booking_id,
                slot_id,
                cancelled_at: now,
                reason: reason.clone(),
            };
            if let Err(e) = self.persist_and_apply(&mut guard, &cancel).await {
                tracing::warn!(%slot_id, %booking_id, error = %e, "slot cancellation stopped mid-way");
                return Ok(report);
            }
            report.cancelled += 1;
            students.push(student_id);

            if !offer_priority {
                continue;
            }
            let grant = PriorityGrant {
                student_id,
                original_slot_id: slot_id,
                original_booking_id: booking_id,
                branch_id: guard.branch_id,
                reason: reason.clone(),
                created_at: now,
                expires_at: now + chrono::Duration::days(config.priority_grant_days),
            };
            if let Err(e) = self.persist_registry(&Event::GrantIssued { grant: grant.clone() }).await {
                tracing::warn!(%slot_id, %student_id, error = %e, "grant issue failed");
                return Ok(report);
            }
            report.grants_issued += 1;
            metrics::counter!(observability::GRANTS_ISSUED_TOTAL).increment(1);
            grants.push(grant);
        }

        if guard.active
            && let Err(e) = self.persist_and_apply(&mut guard, &Event::SlotDeactivated { id: slot_id }).await
        {
            tracing::warn!(%slot_id, error = %e, "slot deactivation failed after cancellation");
        }
        drop(guard);

        self.notify_out(Notification::SlotCancelled {
            slot_id,
            reason: reason.clone(),
            students,
        });
        for grant in grants {
            self.notify_out(Notification::PriorityGranted {
                student_id: grant.student_id,
                original_slot_id: slot_id,
            });
        }
        Ok(report)
    }

    /// Redeem a priority grant: books the student into the chosen slot under
    /// the full admission rules. The grant is consumed atomically, so two
    /// racing redemptions admit at most one; if admission then fails the
    /// grant is restored (unless a newer one replaced it meanwhile).
    pub async fn consume_priority_grant(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
    ) -> Result<(), EngineError> {
        if ctx.role == Role::Student && ctx.user_id != student_id {
            return Err(EngineError::Unauthorized("students may only redeem their own grant"));
        }
        let config = self.config();
        let now = Utc::now();

        let student = self
            .store()
            .get_student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        if self.store().contains_booking(&booking_id) {
            return Err(EngineError::AlreadyExists(booking_id));
        }

        // The grant gives priority access, not rule immunity: the monthly
        // limit and cross-branch toggle apply exactly as in create_booking.
        let slot_date = rs.read().await.date;
        let monthly_count = self.monthly_active_count(student_id, slot_date, None).await;
        let has_bypass = self
            .store()
            .get_bypass(&student_id)
            .is_some_and(|b| !b.is_expired(now));

        let grant = self
            .store()
            .take_active_grant(&student_id, now)
            .ok_or(EngineError::NoActiveGrant(student_id))?;

        let result = self
            .admit_with_grant(&config, now, &grant, booking_id, student, &rs, monthly_count, has_bypass)
            .await;
        match result {
            Ok(()) => {
                metrics::counter!(observability::GRANTS_CONSUMED_TOTAL).increment(1);
                self.notify_out(Notification::BookingConfirmed { booking_id, slot_id, student_id });
                Ok(())
            }
            Err(e) => {
                self.store().restore_grant_if_absent(grant);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn admit_with_grant(
        &self,
        config: &crate::config::SystemConfig,
        now: DateTime<Utc>,
        grant: &PriorityGrant,
        booking_id: Ulid,
        student: Student,
        rs: &super::SharedSlotState,
        monthly_count: u32,
        has_bypass: bool,
    ) -> Result<(), EngineError> {
        let mut guard = rs.write().await;
        if !guard.active {
            return Err(EngineError::NotFound(guard.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        let admission = AdmissionContext {
            now,
            slot_start: guard.starts_at(),
            block: guard.block.as_ref(),
            booked: guard.booked_count(),
            capacity: guard.capacity,
            duplicate: guard.active_booking_for(student.id).is_some(),
            student_branch: student.branch_id,
            slot_branch: guard.branch_id,
            // the grant never bypasses the global cross-branch toggle
            allow_cross_branch: config.allow_cross_branch_booking,
            monthly_count,
            monthly_limit: config.max_bookings_per_month,
            has_bypass,
        };
        if let Err(v) = rules::check_admission(&admission) {
            metrics::counter!(observability::RULE_VIOLATIONS_TOTAL, "rule" => v.code())
                .increment(1);
            return Err(v.into());
        }

        let event = Event::BookingCreated {
            id: booking_id,
            slot_id: guard.id,
            student_id: student.id,
            booked_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        // Revoke only after the booking is durable: a WAL failure here must
        // not leave a replayed grant gone with no booking to show for it.
        if let Err(e) = self
            .persist_registry(&Event::GrantRevoked { student_id: grant.student_id })
            .await
        {
            tracing::warn!(student = %grant.student_id, error = %e, "grant revoke append failed");
        }
        Ok(())
    }

    // ── Administrative overrides ─────────────────────────────
    //
    // Every override lands in the audit log, including failed attempts.
    // BranchAdmins see out-of-scope entities as NotFound.

    /// Book a student into a slot with every business rule waived. Only the
    /// structural invariants hold: the ids must exist, the booking id must
    /// be fresh, and the student may not already hold an active seat here.
    pub async fn force_booking(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let reason = reason.into();
        let result = self.force_booking_inner(ctx, booking_id, student_id, slot_id, &reason).await;
        self.audit_override(ctx, "force_booking", slot_id, &reason, &result);
        result
    }

    async fn force_booking_inner(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        student_id: Ulid,
        slot_id: Ulid,
        reason: &str,
    ) -> Result<(), EngineError> {
        validate_reason(reason)?;
        let now = Utc::now();
        self.store()
            .get_student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        if self.store().contains_booking(&booking_id) {
            return Err(EngineError::AlreadyExists(booking_id));
        }

        let mut guard = rs.write().await;
        self.authorize_admin(ctx, guard.branch_id, slot_id)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }
        if guard.active_booking_for(student_id).is_some() {
            return Err(super::RuleViolation::DuplicateBooking.into());
        }

        let event = Event::BookingCreated { id: booking_id, slot_id, student_id, booked_at: now };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.notify_out(Notification::BookingConfirmed { booking_id, slot_id, student_id });
        Ok(())
    }

    /// Clear a late-cancellation block so the slot becomes bookable again.
    pub async fn unblock_slot(
        &self,
        ctx: &AuthContext,
        slot_id: Ulid,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let reason = reason.into();
        let result = self.unblock_slot_inner(ctx, slot_id, &reason).await;
        self.audit_override(ctx, "unblock_slot", slot_id, &reason, &result);
        result
    }

    async fn unblock_slot_inner(
        &self,
        ctx: &AuthContext,
        slot_id: Ulid,
        reason: &str,
    ) -> Result<(), EngineError> {
        validate_reason(reason)?;
        let rs = self.store().get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = rs.write().await;
        self.authorize_admin(ctx, guard.branch_id, slot_id)?;
        if guard.block.is_none() {
            return Err(EngineError::NotFound(slot_id));
        }
        self.persist_and_apply(&mut guard, &Event::SlotUnblocked { slot_id }).await
    }

    /// Suppress the monthly booking limit for one student for a while.
    pub async fn bypass_monthly_limit(
        &self,
        ctx: &AuthContext,
        student_id: Ulid,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let reason = reason.into();
        let result = self.bypass_monthly_limit_inner(ctx, student_id, &reason).await;
        self.audit_override(ctx, "bypass_monthly_limit", student_id, &reason, &result);
        result
    }

    async fn bypass_monthly_limit_inner(
        &self,
        ctx: &AuthContext,
        student_id: Ulid,
        reason: &str,
    ) -> Result<(), EngineError> {
        validate_reason(reason)?;
        let config = self.config();
        let now = Utc::now();
        let student = self
            .store()
            .get_student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        self.authorize_admin(ctx, student.branch_id, student_id)?;

        let bypass = MonthlyBypass {
            student_id,
            reason: reason.to_owned(),
            granted_by: ctx.user_id,
            granted_at: now,
            expires_at: now + chrono::Duration::days(config.monthly_bypass_days),
        };
        self.persist_registry(&Event::BypassGranted { bypass }).await
    }

    /// Move a booking with the notice window waived. Every other admission
    /// rule still runs against the target slot.
    pub async fn emergency_reschedule(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        new_slot_id: Ulid,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let reason = reason.into();
        let result = self
            .emergency_reschedule_inner(ctx, booking_id, new_slot_id, &reason)
            .await;
        self.audit_override(ctx, "emergency_reschedule", booking_id, &reason, &result);
        result
    }

    async fn emergency_reschedule_inner(
        &self,
        ctx: &AuthContext,
        booking_id: Ulid,
        new_slot_id: Ulid,
        reason: &str,
    ) -> Result<(), EngineError> {
        validate_reason(reason)?;
        let config = self.config();
        let now = Utc::now();

        let old_slot_id = self
            .store()
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if old_slot_id == new_slot_id {
            return Err(EngineError::Validation("cannot reschedule to the same slot"));
        }
        let old_rs = self.store().get_slot(&old_slot_id).ok_or(EngineError::NotFound(old_slot_id))?;
        let new_rs = self.store().get_slot(&new_slot_id).ok_or(EngineError::NotFound(new_slot_id))?;

        let new_slot_date = new_rs.read().await.date;
        let student_probe = {
            let g = old_rs.read().await;
            g.booking(booking_id).map(|b| b.student_id)
        }
        .ok_or(EngineError::NotFound(booking_id))?;
        let monthly_count = self
            .monthly_active_count(student_probe, new_slot_date, Some(booking_id))
            .await;
        let has_bypass = self
            .store()
            .get_bypass(&student_probe)
            .is_some_and(|b| !b.is_expired(now));

        let (mut old_guard, mut new_guard) = if old_slot_id < new_slot_id {
            let a = old_rs.write_owned().await;
            let b = new_rs.write_owned().await;
            (a, b)
        } else {
            let b = new_rs.write_owned().await;
            let a = old_rs.write_owned().await;
            (a, b)
        };

        self.authorize_admin(ctx, new_guard.branch_id, new_slot_id)?;
        let booking = old_guard.booking(booking_id).ok_or(EngineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidBookingStatus { id: booking_id, status: booking.status });
        }
        let student_id = booking.student_id;
        let student = self
            .store()
            .get_student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        if !new_guard.active {
            return Err(EngineError::NotFound(new_slot_id));
        }
        if new_guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        // Same admission as a regular reschedule; only the notice window on
        // the departing slot is skipped.
        let admission = AdmissionContext {
            now,
            slot_start: new_guard.starts_at(),
            block: new_guard.block.as_ref(),
            booked: new_guard.booked_count(),
            capacity: new_guard.capacity,
            duplicate: new_guard.active_booking_for(student_id).is_some(),
            student_branch: student.branch_id,
            slot_branch: new_guard.branch_id,
            allow_cross_branch: config.allow_cross_branch_booking,
            monthly_count,
            monthly_limit: config.max_bookings_per_month,
            has_bypass,
        };
        if let Err(v) = rules::check_admission(&admission) {
            metrics::counter!(observability::RULE_VIOLATIONS_TOTAL, "rule" => v.code())
                .increment(1);
            return Err(v.into());
        }

        let event = Event::BookingMoved {
            id: booking_id,
            from_slot_id: old_slot_id,
            to_slot_id: new_slot_id,
            moved_at: now,
        };
        self.wal_append(&event).await?;
        self.store().apply_move(&mut old_guard, &mut new_guard, booking_id);
        drop(old_guard);
        drop(new_guard);

        self.notify_out(Notification::BookingConfirmed {
            booking_id,
            slot_id: new_slot_id,
            student_id,
        });
        Ok(())
    }

    // ── Expiry sweeps ────────────────────────────────────────

    /// Revoke grants past their expiry. Returns how many were swept.
    pub async fn collect_expired_grants(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for grant in self.store().grants() {
            if grant.is_expired(now) {
                match self
                    .persist_registry(&Event::GrantRevoked { student_id: grant.student_id })
                    .await
                {
                    Ok(()) => swept += 1,
                    Err(e) => {
                        tracing::warn!(student = %grant.student_id, error = %e, "grant sweep failed");
                    }
                }
            }
        }
        swept
    }

    /// Revoke monthly bypasses past their expiry. Returns how many were swept.
    pub async fn collect_expired_bypasses(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for bypass in self.store().bypasses() {
            if bypass.is_expired(now) {
                match self
                    .persist_registry(&Event::BypassRevoked { student_id: bypass.student_id })
                    .await
                {
                    Ok(()) => swept += 1,
                    Err(e) => {
                        tracing::warn!(student = %bypass.student_id, error = %e, "bypass sweep failed");
                    }
                }
            }
        }
        swept
    }

    // ── Helpers ──────────────────────────────────────────────

    /// Admin gate with branch scoping: BranchAdmins see entities outside
    /// their branch as if they did not exist.
    fn authorize_admin(
        &self,
        ctx: &AuthContext,
        branch_id: Ulid,
        entity_id: Ulid,
    ) -> Result<(), EngineError> {
        if !ctx.is_admin() {
            return Err(EngineError::Unauthorized("admin role required"));
        }
        if !ctx.administers_branch(branch_id) {
            return Err(EngineError::NotFound(entity_id));
        }
        Ok(())
    }

    fn audit_override(
        &self,
        ctx: &AuthContext,
        action: &'static str,
        entity_id: Ulid,
        reason: &str,
        result: &Result<(), EngineError>,
    ) {
        let outcome = match result {
            Ok(()) => AuditOutcome::Ok,
            Err(e) => AuditOutcome::Failed(e.to_string()),
        };
        metrics::counter!(observability::OVERRIDES_TOTAL, "action" => action).increment(1);
        self.audit.record(ctx, action, entity_id, reason, outcome);
    }

    /// Active bookings the student holds in the calendar month of
    /// `month_of`, across all branches. Takes only read locks, so it must
    /// run before the caller locks its target slot.
    pub(super) async fn monthly_active_count(
        &self,
        student_id: Ulid,
        month_of: NaiveDate,
        exclude: Option<Ulid>,
    ) -> u32 {
        let mut count = 0;
        for booking_id in self.store().bookings_for_student(&student_id) {
            if Some(booking_id) == exclude {
                continue;
            }
            let Some(slot_id) = self.store().slot_for_booking(&booking_id) else { continue };
            let Some(rs) = self.store().get_slot(&slot_id) else { continue };
            let guard = rs.read().await;
            if let Some(b) = guard.booking(booking_id)
                && b.status.is_active()
                && rules::same_month(guard.date, month_of)
            {
                count += 1;
            }
        }
        count
    }
}
