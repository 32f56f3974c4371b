use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PresenceMetricsSnapshot {
    pub heartbeats_enqueued: u64,
    pub heartbeats_dropped: u64,
    pub events_processed: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub friends_refresh_ok: u64,
    pub friends_refresh_err: u64,
    pub party_refresh_ok: u64,
    pub party_refresh_err: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub party_snapshots_sent: u64,
}

#[derive(Debug, Default)]
pub struct PresenceMetrics {
    pub heartbeats_enqueued: AtomicU64,
    pub heartbeats_dropped: AtomicU64,
    pub events_processed: AtomicU64,
    pub notifications_delivered: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub friends_refresh_ok: AtomicU64,
    pub friends_refresh_err: AtomicU64,
    pub party_refresh_ok: AtomicU64,
    pub party_refresh_err: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub party_snapshots_sent: AtomicU64,
}

impl PresenceMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PresenceMetricsSnapshot {
        PresenceMetricsSnapshot {
            heartbeats_enqueued: self.heartbeats_enqueued.load(Ordering::Relaxed),
            heartbeats_dropped: self.heartbeats_dropped.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            friends_refresh_ok: self.friends_refresh_ok.load(Ordering::Relaxed),
            friends_refresh_err: self.friends_refresh_err.load(Ordering::Relaxed),
            party_refresh_ok: self.party_refresh_ok.load(Ordering::Relaxed),
            party_refresh_err: self.party_refresh_err.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            party_snapshots_sent: self.party_snapshots_sent.load(Ordering::Relaxed),
        }
    }
}
