mod availability;
mod error;
mod mutations;
mod queries;
mod rules;
mod store;

pub use availability::{slot_availability, AvailabilityFilter};
pub use error::EngineError;
pub use rules::RuleViolation;
pub use store::{SharedSlotState, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::audit::AuditLog;
use crate::config::SystemConfig;
use crate::model::*;
use crate::notify::{LogNotifier, Notifier, NotifyHub};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// External delivery gateway; swapped out in tests.
    notifier: Arc<dyn Notifier>,
    /// Booking rules. Each operation snapshots this once at its start, so a
    /// config swap mid-operation never yields a mixed reading.
    config: std::sync::RwLock<SystemConfig>,
    pub audit: AuditLog,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: SystemConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            notifier: Arc::new(LogNotifier),
            config: std::sync::RwLock::new(config),
            audit: AuditLog::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            match event {
                Event::SlotCreated { id, teacher_id, branch_id, date, start_time, end_time, capacity } => {
                    let rs = SlotState::new(
                        *id, *teacher_id, *branch_id, *date, *start_time, *end_time, *capacity,
                    );
                    engine.store.insert_slot(*id, Arc::new(RwLock::new(rs)));
                }
                Event::BookingMoved { id, from_slot_id, to_slot_id, .. } => {
                    if let (Some(from), Some(to)) = (
                        engine.store.get_slot(from_slot_id),
                        engine.store.get_slot(to_slot_id),
                    ) {
                        let mut f = from.try_write().expect("replay: uncontended write");
                        let mut t = to.try_write().expect("replay: uncontended write");
                        engine.store.apply_move(&mut f, &mut t, *id);
                    }
                }
                other => {
                    if let Some(slot_id) = event_slot_id(other) {
                        if let Some(entry) = engine.store.get_slot(&slot_id) {
                            let mut guard = entry.try_write().expect("replay: uncontended write");
                            engine.store.apply_slot_event(&mut guard, other);
                        }
                    } else {
                        engine.store.apply_registry_event(other);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::SLOTS_ACTIVE)
            .set(engine.store.slot_count() as f64);

        Ok(engine)
    }

    /// Replace the external notification gateway (builder-style, pre-Arc).
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub(super) fn store(&self) -> &Store {
        &self.store
    }

    pub(super) fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    /// Snapshot of the booking rules, taken once per operation.
    pub fn config(&self) -> SystemConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Swap the booking rules. In-flight operations finish under the
    /// snapshot they took; subsequent operations see the new values.
    pub fn set_config(&self, config: SystemConfig) {
        *self.config.write().expect("config lock poisoned") = config;
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply to locked slot state in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_slot_event(rs, event);
        Ok(())
    }

    /// WAL-append + apply for registry-level events (students, grants, bypasses).
    pub(super) async fn persist_registry(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_registry_event(event);
        Ok(())
    }

    /// In-process fan-out plus fire-and-forget external delivery. Called
    /// only after the state transition has committed.
    pub(super) fn notify_out(&self, notification: crate::notify::Notification) {
        self.notify.send(&notification);
        crate::notify::dispatch(self.notifier(), notification);
    }

    /// Lookup booking → slot, get slot, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &ulid::Ulid,
    ) -> Result<(ulid::Ulid, tokio::sync::OwnedRwLockWriteGuard<SlotState>), EngineError> {
        let slot_id = self
            .store
            .slot_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .store
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.write_owned().await;
        Ok((slot_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Rescheduled bookings are collapsed into
    /// a single create on their current slot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for student in self.store.students_snapshot() {
            events.push(Event::StudentRegistered { id: student.id, branch_id: student.branch_id });
        }

        for slot_id in self.store.slot_ids() {
            let Some(entry) = self.store.get_slot(&slot_id) else { continue };
            let guard = entry.read().await;

            events.push(Event::SlotCreated {
                id: guard.id,
                teacher_id: guard.teacher_id,
                branch_id: guard.branch_id,
                date: guard.date,
                start_time: guard.start_time,
                end_time: guard.end_time,
                capacity: guard.capacity,
            });

            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: booking.id,
                    slot_id: guard.id,
                    student_id: booking.student_id,
                    booked_at: booking.booked_at,
                });
                match booking.status {
                    BookingStatus::Confirmed => {}
                    BookingStatus::Cancelled => events.push(Event::BookingCancelled {
                        id: booking.id,
                        slot_id: guard.id,
                        cancelled_at: booking.cancelled_at.unwrap_or(booking.booked_at),
                        reason: booking.cancellation_reason.clone().unwrap_or_default(),
                    }),
                    BookingStatus::Completed => events.push(Event::AttendanceMarked {
                        id: booking.id,
                        slot_id: guard.id,
                        attended: true,
                    }),
                    BookingStatus::NoShow => events.push(Event::AttendanceMarked {
                        id: booking.id,
                        slot_id: guard.id,
                        attended: false,
                    }),
                }
            }

            if let Some(block) = &guard.block {
                events.push(Event::SlotBlocked { slot_id: guard.id, block: block.clone() });
            }
            if !guard.active {
                events.push(Event::SlotDeactivated { id: guard.id });
            }
        }

        for grant in self.store.grants() {
            events.push(Event::GrantIssued { grant });
        }
        for bypass in self.store.bypasses() {
            events.push(Event::BypassGranted { bypass });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
