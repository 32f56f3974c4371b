use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::identity::UserId;
use crate::metrics::PresenceMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    /// A session was just established.
    Connected,
    /// The client sent a ping on an open session.
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user: UserId,
    pub kind: PresenceKind,
}

impl PresenceEvent {
    pub fn new(user: UserId, kind: PresenceKind) -> Self {
        Self { user, kind }
    }
}

/// Producer side of the ingestion queue. Cheap to clone, one per session.
#[derive(Clone)]
pub struct PresenceSender {
    tx: mpsc::Sender<PresenceEvent>,
    overflow_wait: Duration,
    metrics: Arc<PresenceMetrics>,
}

pub type PresenceReceiver = mpsc::Receiver<PresenceEvent>;

pub fn presence_queue(
    capacity: usize,
    overflow_wait: Duration,
    metrics: Arc<PresenceMetrics>,
) -> (PresenceSender, PresenceReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        PresenceSender {
            tx,
            overflow_wait,
            metrics,
        },
        rx,
    )
}

impl PresenceSender {
    /// Enqueues without waiting. Returns `false` if the event was dropped.
    pub fn try_submit(&self, event: PresenceEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                PresenceMetrics::incr(&self.metrics.heartbeats_enqueued);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped(&event.user, "queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped(&event.user, "queue closed");
                false
            }
        }
    }

    /// Enqueues, waiting at most the configured overflow window when the
    /// queue is full. Returns `false` if the event was dropped.
    pub async fn submit(&self, event: PresenceEvent) -> bool {
        let event = match self.tx.try_send(event) {
            Ok(()) => {
                PresenceMetrics::incr(&self.metrics.heartbeats_enqueued);
                return true;
            }
            Err(mpsc::error::TrySendError::Full(event)) => event,
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped(&event.user, "queue closed");
                return false;
            }
        };

        match self.tx.send_timeout(event, self.overflow_wait).await {
            Ok(()) => {
                PresenceMetrics::incr(&self.metrics.heartbeats_enqueued);
                true
            }
            Err(mpsc::error::SendTimeoutError::Timeout(event)) => {
                self.dropped(&event.user, "queue full");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(event)) => {
                self.dropped(&event.user, "queue closed");
                false
            }
        }
    }

    fn dropped(&self, user: &UserId, reason: &str) {
        PresenceMetrics::incr(&self.metrics.heartbeats_dropped);
        warn!(user = %user, reason, "presence event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> PresenceEvent {
        PresenceEvent::new(UserId::parse(name).unwrap(), PresenceKind::Heartbeat)
    }

    #[tokio::test]
    async fn events_arrive_in_submission_order() {
        let metrics = Arc::new(PresenceMetrics::default());
        let (tx, mut rx) = presence_queue(8, Duration::from_millis(10), Arc::clone(&metrics));
        for name in ["a", "b", "c"] {
            assert!(tx.submit(event(name)).await);
        }
        for name in ["a", "b", "c"] {
            assert_eq!(rx.recv().await.unwrap().user.as_str(), name);
        }
        assert_eq!(metrics.snapshot().heartbeats_enqueued, 3);
    }

    #[tokio::test]
    async fn full_queue_drops_after_overflow_wait() {
        let metrics = Arc::new(PresenceMetrics::default());
        let (tx, _rx) = presence_queue(1, Duration::from_millis(20), Arc::clone(&metrics));
        assert!(tx.try_submit(event("a")));
        assert!(!tx.try_submit(event("b")));
        assert!(!tx.submit(event("c")).await);

        let snap = metrics.snapshot();
        assert_eq!(snap.heartbeats_enqueued, 1);
        assert_eq!(snap.heartbeats_dropped, 2);
    }

    #[tokio::test]
    async fn waiting_producer_succeeds_once_space_frees() {
        let metrics = Arc::new(PresenceMetrics::default());
        let (tx, mut rx) = presence_queue(1, Duration::from_secs(1), metrics);
        assert!(tx.try_submit(event("a")));

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            (first, second)
        });
        assert!(tx.submit(event("b")).await);
        let (first, second) = consumer.await.unwrap();
        assert_eq!(first.user.as_str(), "a");
        assert_eq!(second.user.as_str(), "b");
    }

    #[tokio::test]
    async fn closed_queue_drops() {
        let metrics = Arc::new(PresenceMetrics::default());
        let (tx, rx) = presence_queue(4, Duration::from_millis(10), Arc::clone(&metrics));
        drop(rx);
        assert!(!tx.submit(event("a")).await);
        assert_eq!(metrics.snapshot().heartbeats_dropped, 1);
    }
}
