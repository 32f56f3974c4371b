use std::time::Duration;

use moka::sync::Cache;

use crate::identity::UserId;

/// TTL-bounded online flags.
///
/// A present key always maps to `true`; absence means offline. Entries
/// expire `ttl` after their last write, and the cache never holds more than
/// `max_capacity` entries (each entry weighs 1).
pub struct StatusStore {
    online: Cache<UserId, bool>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let online = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { online, ttl }
    }

    /// Sets or refreshes the online flag for `user`.
    pub fn mark_online(&self, user: &UserId) {
        self.online.insert(user.clone(), true);
    }

    /// Returns `false` for unknown or expired users.
    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.get(user).unwrap_or(false)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Approximate number of tracked users; expired entries may linger until
    /// the cache runs its housekeeping.
    pub fn approximate_len(&self) -> u64 {
        self.online.entry_count()
    }
}
