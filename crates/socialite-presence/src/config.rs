use std::time::Duration;

use crate::error::PresenceError;

/// Online flags expire this long after the last heartbeat.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Time-to-live of an online flag after the last heartbeat.
    pub status_ttl: Duration,
    /// Upper bound on tracked online flags before cost-based eviction kicks in.
    pub status_capacity: u64,
    /// Capacity of the presence ingestion queue.
    pub queue_capacity: usize,
    /// How long a producer may wait on a full queue before the event is dropped.
    pub queue_overflow_wait: Duration,
    /// Capacity of each session's outbound frame queue.
    pub session_outbound_capacity: usize,
    /// Period of the friend-list refresh loop.
    pub friends_refresh_interval: Duration,
    /// Period of the party-membership refresh loop.
    pub party_refresh_interval: Duration,
    /// Delay before retrying a failed refresh cycle.
    pub refresh_retry_delay: Duration,
    /// Period of each party session's snapshot poller.
    pub party_poll_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            status_ttl: DEFAULT_STATUS_TTL,
            status_capacity: 100_000,
            queue_capacity: 1_000,
            queue_overflow_wait: Duration::from_millis(50),
            session_outbound_capacity: 64,
            friends_refresh_interval: Duration::from_secs(60),
            party_refresh_interval: Duration::from_secs(60),
            refresh_retry_delay: Duration::from_secs(5),
            party_poll_interval: Duration::from_secs(5),
        }
    }
}

impl PresenceConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), PresenceError> {
        if self.status_ttl.is_zero() {
            return Err(PresenceError::InvalidConfig("status_ttl must be non-zero"));
        }
        if self.status_capacity == 0 {
            return Err(PresenceError::InvalidConfig("status_capacity must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(PresenceError::InvalidConfig("queue_capacity must be non-zero"));
        }
        if self.session_outbound_capacity == 0 {
            return Err(PresenceError::InvalidConfig(
                "session_outbound_capacity must be non-zero",
            ));
        }
        if self.friends_refresh_interval.is_zero()
            || self.party_refresh_interval.is_zero()
            || self.party_poll_interval.is_zero()
        {
            return Err(PresenceError::InvalidConfig("intervals must be non-zero"));
        }
        Ok(())
    }

    /// Retry delay clamped so a failed cycle never waits longer than a regular one.
    pub fn retry_delay_for(&self, interval: Duration) -> Duration {
        self.refresh_retry_delay.min(interval)
    }
}
