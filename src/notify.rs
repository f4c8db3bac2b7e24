use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// How long an external delivery attempt may take before it is abandoned.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound notification kinds. Delivery is best-effort; the booking state
/// transition has already committed by the time one of these is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BookingConfirmed { booking_id: Ulid, slot_id: Ulid, student_id: Ulid },
    BookingCancelled { booking_id: Ulid, slot_id: Ulid, student_id: Ulid, reason: String },
    SlotCancelled { slot_id: Ulid, reason: String, students: Vec<Ulid> },
    PriorityGranted { student_id: Ulid, original_slot_id: Ulid },
}

impl Notification {
    /// Key used to route the notification to in-process subscribers:
    /// the student for individual events, the slot for batch events.
    pub fn channel_key(&self) -> Ulid {
        match self {
            Notification::BookingConfirmed { student_id, .. }
            | Notification::BookingCancelled { student_id, .. }
            | Notification::PriorityGranted { student_id, .. } => *student_id,
            Notification::SlotCancelled { slot_id, .. } => *slot_id,
        }
    }
}

/// Broadcast hub for in-process subscribers (dashboards, tests).
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to notifications for a student or slot. Creates the channel
    /// if needed.
    pub fn subscribe(&self, key: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.channel_key()) {
            let _ = sender.send(notification.clone());
        }
    }

    pub fn remove(&self, key: &Ulid) {
        self.channels.remove(key);
    }
}

/// External delivery seam (push/SMS/email gateway). Implementations live
/// outside the engine; errors are logged, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

/// Default notifier: records deliveries to the log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        tracing::info!(?notification, "notification dispatched");
        Ok(())
    }
}

/// Fire-and-forget external dispatch with a bounded timeout. Spawned after
/// the state transition commits; failure never rolls anything back.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        match tokio::time::timeout(DISPATCH_TIMEOUT, notifier.deliver(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(?notification, error = %e, "notification delivery failed");
            }
            Err(_) => {
                tracing::warn!(?notification, "notification delivery timed out");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let student = Ulid::new();
        let mut rx = hub.subscribe(student);

        let n = Notification::BookingConfirmed {
            booking_id: Ulid::new(),
            slot_id: Ulid::new(),
            student_id: student,
        };
        hub.send(&n);

        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Notification::PriorityGranted {
            student_id: Ulid::new(),
            original_slot_id: Ulid::new(),
        });
    }

    #[tokio::test]
    async fn batch_routed_by_slot() {
        let hub = NotifyHub::new();
        let slot = Ulid::new();
        let mut rx = hub.subscribe(slot);

        hub.send(&Notification::SlotCancelled {
            slot_id: slot,
            reason: "teacher unavailable".into(),
            students: vec![Ulid::new(), Ulid::new()],
        });

        match rx.recv().await.unwrap() {
            Notification::SlotCancelled { students, .. } => assert_eq!(students.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn deliver(&self, _n: &Notification) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_is_fire_and_forget() {
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        dispatch(
            notifier.clone(),
            Notification::PriorityGranted { student_id: Ulid::new(), original_slot_id: Ulid::new() },
        );
        // give the spawned task a beat
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn deliver(&self, _n: &Notification) -> Result<(), String> {
            Err("gateway down".into())
        }
    }

    #[tokio::test]
    async fn dispatch_swallows_delivery_errors() {
        dispatch(
            Arc::new(FailingNotifier),
            Notification::PriorityGranted { student_id: Ulid::new(), original_slot_id: Ulid::new() },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        // nothing to assert beyond "no panic, no propagation"
    }
}
