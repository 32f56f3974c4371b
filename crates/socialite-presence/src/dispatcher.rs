use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::StatusMessage;
use crate::metrics::PresenceMetrics;
use crate::queue::{PresenceEvent, PresenceReceiver};
use crate::registry::{ConnectionRegistry, DeliveryError};
use crate::relationships::RelationshipCache;
use crate::status::StatusStore;

/// Outcome of fanning out one presence event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Friends known for the user.
    pub recipients: usize,
    /// Friends whose session accepted the notice.
    pub delivered: usize,
    /// Friends with no open session.
    pub offline: usize,
    /// Friends whose session rejected the notice (full or closed).
    pub failed: usize,
}

/// Single consumer of the presence queue.
#[derive(Clone)]
pub struct PresenceDispatcher {
    status: Arc<StatusStore>,
    relationships: Arc<RelationshipCache>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<PresenceMetrics>,
}

impl PresenceDispatcher {
    pub fn new(
        status: Arc<StatusStore>,
        relationships: Arc<RelationshipCache>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<PresenceMetrics>,
    ) -> Self {
        Self {
            status,
            relationships,
            registry,
            metrics,
        }
    }

    /// Marks the user online and notifies every friend holding a session.
    /// A failed delivery only affects that friend.
    pub fn process(&self, event: &PresenceEvent) -> FanoutReport {
        self.status.mark_online(&event.user);
        PresenceMetrics::incr(&self.metrics.events_processed);

        let friends = self.relationships.friends_of(&event.user);
        let mut report = FanoutReport {
            recipients: friends.len(),
            ..FanoutReport::default()
        };
        if friends.is_empty() {
            return report;
        }

        let notice = StatusMessage::FriendsOnline {
            user_name: event.user.clone(),
        }
        .to_json();

        for friend in friends.iter() {
            let Some(handle) = self.registry.lookup(friend) else {
                report.offline += 1;
                continue;
            };
            match handle.try_deliver(notice.clone()) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::QueueFull) => {
                    report.failed += 1;
                    warn!(friend = %friend, user = %event.user, "friend session queue full, notice dropped");
                }
                Err(DeliveryError::Closed) => {
                    report.failed += 1;
                    if self
                        .registry
                        .deregister_session(friend, handle.session_id())
                    {
                        debug!(friend = %friend, session = handle.session_id(), "removed closed session");
                    }
                }
            }
        }

        PresenceMetrics::add(&self.metrics.notifications_delivered, report.delivered as u64);
        PresenceMetrics::add(&self.metrics.notifications_failed, report.failed as u64);
        debug!(
            user = %event.user,
            kind = ?event.kind,
            recipients = report.recipients,
            delivered = report.delivered,
            "presence event dispatched"
        );
        report
    }

    /// Consumes events until the queue closes or `shutdown` fires.
    pub async fn run(self, mut events: PresenceReceiver, shutdown: CancellationToken) {
        info!("presence dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.process(&event);
                        }
                        None => break,
                    }
                }
            }
        }
        info!("presence dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::identity::UserId;
    use crate::queue::{presence_queue, PresenceKind};
    use crate::registry::ConnectionHandle;

    fn user(name: &str) -> UserId {
        UserId::parse(name).unwrap()
    }

    fn dispatcher() -> PresenceDispatcher {
        PresenceDispatcher::new(
            Arc::new(StatusStore::new(Duration::from_secs(10), 10_000)),
            Arc::new(RelationshipCache::new()),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(PresenceMetrics::default()),
        )
    }

    fn heartbeat(name: &str) -> PresenceEvent {
        PresenceEvent::new(user(name), PresenceKind::Heartbeat)
    }

    #[test]
    fn each_online_friend_gets_exactly_one_notice() {
        let d = dispatcher();
        d.relationships
            .replace_friends(user("u"), vec![user("a"), user("b"), user("c")]);
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        d.registry.register(user("a"), ConnectionHandle::new(1, tx_a));
        d.registry.register(user("b"), ConnectionHandle::new(2, tx_b));

        let report = d.process(&heartbeat("U"));
        assert_eq!(
            report,
            FanoutReport {
                recipients: 3,
                delivered: 2,
                offline: 1,
                failed: 0
            }
        );
        assert!(d.status.is_online(&user("u")));

        let expected = r#"{"msg_type":"friends_online","user_name":"u"}"#;
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert_eq!(rx_b.try_recv().unwrap(), expected);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn user_without_friends_is_still_marked_online() {
        let d = dispatcher();
        let report = d.process(&heartbeat("loner"));
        assert_eq!(report.recipients, 0);
        assert!(d.status.is_online(&user("loner")));
    }

    #[test]
    fn failed_delivery_does_not_abort_fanout() {
        let d = dispatcher();
        d.relationships
            .replace_friends(user("u"), vec![user("closed"), user("full"), user("ok")]);

        let (tx_closed, rx_closed) = mpsc::channel(1);
        drop(rx_closed);
        let (tx_full, _rx_full) = mpsc::channel(1);
        tx_full.try_send("filler".to_string()).unwrap();
        let (tx_ok, mut rx_ok) = mpsc::channel(1);

        d.registry
            .register(user("closed"), ConnectionHandle::new(1, tx_closed));
        d.registry.register(user("full"), ConnectionHandle::new(2, tx_full));
        d.registry.register(user("ok"), ConnectionHandle::new(3, tx_ok));

        let report = d.process(&heartbeat("u"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert!(rx_ok.try_recv().is_ok());
        assert!(d.registry.lookup(&user("closed")).is_none());
        assert!(d.registry.lookup(&user("full")).is_some());

        let snap = d.metrics.snapshot();
        assert_eq!(snap.notifications_delivered, 1);
        assert_eq!(snap.notifications_failed, 2);
    }

    #[tokio::test]
    async fn run_drains_queue_until_cancelled() {
        let d = dispatcher();
        let metrics = Arc::clone(&d.metrics);
        let status = Arc::clone(&d.status);
        let (tx, rx) = presence_queue(16, Duration::from_millis(10), Arc::clone(&metrics));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(d.run(rx, shutdown.clone()));

        for name in ["a", "b", "c"] {
            assert!(tx.submit(heartbeat(name)).await);
        }
        for _ in 0..100 {
            if metrics.snapshot().events_processed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(status.is_online(&user("c")));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("dispatcher exits on cancel")
            .unwrap();
    }
}
