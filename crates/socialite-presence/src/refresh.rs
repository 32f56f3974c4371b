//! Periodic reload of the friend and party graph from durable storage.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PresenceError, SourceError};
use crate::identity::{PartyId, UserId};
use crate::metrics::PresenceMetrics;
use crate::relationships::RelationshipCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Invited,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyMembership {
    pub party: PartyId,
    pub user: UserId,
    pub status: MembershipStatus,
}

/// Durable source of the relationship graph. Reads are bulk and may lag
/// behind writes; the engine never writes back.
pub trait RelationshipSource: Send + Sync + 'static {
    /// Every user with at least one confirmed friend, mapped to those friends.
    fn fetch_all_friend_lists(&self) -> Result<HashMap<UserId, Vec<UserId>>, SourceError>;

    /// Every party with at least one active member, mapped to those members.
    fn fetch_all_active_party_memberships(
        &self,
    ) -> Result<HashMap<PartyId, Vec<UserId>>, SourceError>;

    /// Membership of `user` in `party`, in any status.
    fn fetch_party_membership(
        &self,
        party: &PartyId,
        user: &UserId,
    ) -> Result<Option<PartyMembership>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Friends,
    Parties,
}

impl fmt::Display for RefreshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshKind::Friends => f.write_str("friends"),
            RefreshKind::Parties => f.write_str("parties"),
        }
    }
}

/// One friend-list cycle. On error the cache is left untouched.
pub async fn refresh_friends_once(
    source: &Arc<dyn RelationshipSource>,
    cache: &RelationshipCache,
) -> Result<usize, PresenceError> {
    let source = Arc::clone(source);
    let snapshot = tokio::task::spawn_blocking(move || source.fetch_all_friend_lists()).await??;
    Ok(cache.refresh_friends(snapshot))
}

/// One party-membership cycle. On error the cache is left untouched.
pub async fn refresh_parties_once(
    source: &Arc<dyn RelationshipSource>,
    cache: &RelationshipCache,
) -> Result<usize, PresenceError> {
    let source = Arc::clone(source);
    let snapshot =
        tokio::task::spawn_blocking(move || source.fetch_all_active_party_memberships()).await??;
    Ok(cache.refresh_members(snapshot))
}

pub struct RefreshLoop {
    pub kind: RefreshKind,
    pub interval: Duration,
    pub retry_delay: Duration,
    pub source: Arc<dyn RelationshipSource>,
    pub cache: Arc<RelationshipCache>,
    pub metrics: Arc<PresenceMetrics>,
}

impl RefreshLoop {
    /// Runs a cycle immediately, then after `interval` (or `retry_delay`
    /// following a failure) until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(kind = %self.kind, interval = ?self.interval, "relationship refresh started");
        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            // A source stuck in a blocking read must not hold up shutdown.
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.cycle() => result,
            };
            wait = match result {
                Ok(entries) => {
                    debug!(kind = %self.kind, entries, "relationship refresh applied");
                    self.interval
                }
                Err(err) => {
                    warn!(kind = %self.kind, "relationship refresh failed, keeping previous snapshot: {err}");
                    self.retry_delay
                }
            };
        }
        info!(kind = %self.kind, "relationship refresh stopped");
    }

    async fn cycle(&self) -> Result<usize, PresenceError> {
        let (result, ok, err) = match self.kind {
            RefreshKind::Friends => (
                refresh_friends_once(&self.source, &self.cache).await,
                &self.metrics.friends_refresh_ok,
                &self.metrics.friends_refresh_err,
            ),
            RefreshKind::Parties => (
                refresh_parties_once(&self.source, &self.cache).await,
                &self.metrics.party_refresh_ok,
                &self.metrics.party_refresh_err,
            ),
        };
        PresenceMetrics::incr(if result.is_ok() { ok } else { err });
        result
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::MemorySource;
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn failed_cycle_keeps_previous_snapshot() {
        let memory = Arc::new(MemorySource::default());
        memory.befriend("u", "a");
        let source: Arc<dyn RelationshipSource> = memory.clone();
        let cache = RelationshipCache::new();

        assert_eq!(refresh_friends_once(&source, &cache).await.unwrap(), 2);
        assert_eq!(&*cache.friends_of(&user("u")), &[user("a")]);

        memory.set_failing(true);
        memory.befriend("u", "b");
        assert!(matches!(
            refresh_friends_once(&source, &cache).await,
            Err(PresenceError::Source(SourceError::Unavailable(_)))
        ));
        assert_eq!(&*cache.friends_of(&user("u")), &[user("a")]);

        memory.set_failing(false);
        refresh_friends_once(&source, &cache).await.unwrap();
        assert_eq!(&*cache.friends_of(&user("u")), &[user("a"), user("b")]);
    }

    #[tokio::test]
    async fn party_cycle_replaces_members() {
        let memory = Arc::new(MemorySource::default());
        memory.join("p", "u");
        memory.join("p", "v");
        let source: Arc<dyn RelationshipSource> = memory.clone();
        let cache = RelationshipCache::new();

        assert_eq!(refresh_parties_once(&source, &cache).await.unwrap(), 1);
        let party = PartyId::parse("p").unwrap();
        assert_eq!(cache.members_of(&party).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_immediately_then_on_interval_and_retries_sooner() {
        let memory = Arc::new(MemorySource::default());
        memory.befriend("u", "a");
        let source: Arc<dyn RelationshipSource> = memory.clone();
        let cache = Arc::new(RelationshipCache::new());
        let metrics = Arc::new(PresenceMetrics::default());
        let shutdown = CancellationToken::new();

        let handle = RefreshLoop {
            kind: RefreshKind::Friends,
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            source,
            cache: Arc::clone(&cache),
            metrics: Arc::clone(&metrics),
        }
        .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(memory.friend_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.friend_list_count(), 2);

        memory.set_failing(true);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(memory.friend_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.snapshot().friends_refresh_err, 1);
        assert_eq!(cache.friend_list_count(), 2);

        memory.set_failing(false);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(memory.friend_fetches.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().friends_refresh_ok, 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
    /// Friend fetch that blocks until released.
    struct StalledSource {
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl RelationshipSource for StalledSource {
        fn fetch_all_friend_lists(&self) -> Result<HashMap<UserId, Vec<UserId>>, SourceError> {
            let release = self.release.lock().unwrap();
            let _ = release.recv_timeout(Duration::from_secs(5));
            Ok(HashMap::new())
        }

        fn fetch_all_active_party_memberships(
            &self,
        ) -> Result<HashMap<PartyId, Vec<UserId>>, SourceError> {
            Ok(HashMap::new())
        }

        fn fetch_party_membership(
            &self,
            _party: &PartyId,
            _user: &UserId,
        ) -> Result<Option<PartyMembership>, SourceError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_cycle() {
        let (release, rx) = std::sync::mpsc::channel();
        let source: Arc<dyn RelationshipSource> = Arc::new(StalledSource {
            release: std::sync::Mutex::new(rx),
        });
        let metrics = Arc::new(PresenceMetrics::default());
        let shutdown = CancellationToken::new();
        let handle = RefreshLoop {
            kind: RefreshKind::Friends,
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            source,
            cache: Arc::new(RelationshipCache::new()),
            metrics: Arc::clone(&metrics),
        }
        .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stops while the fetch is blocked")
            .unwrap();
        assert_eq!(metrics.snapshot().friends_refresh_ok, 0);
        release.send(()).unwrap();
    }
}
