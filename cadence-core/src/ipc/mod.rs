//! Notification Sink: the one-way channel every session reports through.
//!
//! Sinks are fire-and-forget: `notify` must never block the calling
//! inference thread for more than a bounded, negligible time. A sink with no
//! listener silently drops the notification.

pub mod events;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use events::{Notification, NotificationKind, NotificationSource};

/// Broadcast capacity: notifications buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Receiver side of a notification stream.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

/// Fan-out sink backed by a `tokio::sync::broadcast` channel.
///
/// `send` never blocks; slow subscribers observe `Lagged` instead of
/// stalling the producer.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl NotificationSink for crossbeam_channel::Sender<Notification> {
    fn notify(&self, notification: Notification) {
        let _ = self.try_send(notification);
    }
}

/// Mirrors notifications into the tracing log.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::Error => error!(seq = n.seq, source = ?n.source, "{}", n.message),
            NotificationKind::Warning => warn!(seq = n.seq, source = ?n.source, "{}", n.message),
            NotificationKind::Token => debug!(seq = n.seq, source = ?n.source, "{}", n.message),
            _ => info!(seq = n.seq, source = ?n.source, "{}", n.message),
        }
    }
}

/// Shared handle sessions use to emit notifications.
///
/// Cheap to clone; all clones share one sequence counter.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    seq: Arc<AtomicU64>,
}

impl Notifier {
    pub fn new<S: NotificationSink>(sink: S) -> Self {
        Self::from_arc(Arc::new(sink))
    }

    pub fn from_arc(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A notifier that only writes to the tracing log.
    pub fn tracing() -> Self {
        Self::new(TracingSink)
    }

    pub fn emit(&self, source: NotificationSource, kind: NotificationKind, message: impl Into<String>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.sink.notify(Notification {
            seq,
            source,
            kind,
            message: message.into(),
        });
    }

    pub fn progress(&self, source: NotificationSource, message: impl Into<String>) {
        self.emit(source, NotificationKind::Progress, message);
    }

    pub fn warning(&self, source: NotificationSource, message: impl Into<String>) {
        self.emit(source, NotificationKind::Warning, message);
    }

    pub fn error(&self, source: NotificationSource, message: impl Into<String>) {
        self.emit(source, NotificationKind::Error, message);
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn notifier_stamps_increasing_sequence_numbers() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let notifier = Notifier::new(tx);
        let clone = notifier.clone();

        notifier.progress(NotificationSource::Backend, "one");
        clone.error(NotificationSource::Generation, "two");

        let first = rx.recv_timeout(Duration::from_secs(1)).expect("first");
        let second = rx.recv_timeout(Duration::from_secs(1)).expect("second");
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.kind, NotificationKind::Error);
        assert_eq!(second.message, "two");
    }

    #[test]
    fn broadcast_sink_without_subscribers_does_not_block() {
        let notifier = Notifier::new(BroadcastSink::new());
        for i in 0..(BROADCAST_CAP * 2) {
            notifier.progress(NotificationSource::Gate, format!("{i}"));
        }
    }

    #[test]
    fn broadcast_sink_delivers_to_subscriber() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();
        let notifier = Notifier::new(sink);
        notifier.warning(NotificationSource::Ingest, "backpressure");

        let n = rx.try_recv().expect("notification delivered");
        assert_eq!(n.kind, NotificationKind::Warning);
        assert_eq!(n.source, NotificationSource::Ingest);
    }
}
