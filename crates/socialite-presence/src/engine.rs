use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::config::PresenceConfig;
use crate::dispatcher::PresenceDispatcher;
use crate::error::PresenceError;
use crate::identity::{PartyId, UserId};
use crate::metrics::{PresenceMetrics, PresenceMetricsSnapshot};
use crate::party::PartyPoller;
use crate::queue::{presence_queue, PresenceEvent, PresenceKind, PresenceSender};
use crate::refresh::{
    refresh_friends_once, refresh_parties_once, PartyMembership, RefreshKind, RefreshLoop,
    RelationshipSource,
};
use crate::registry::{ConnectionHandle, ConnectionRegistry, SessionId};
use crate::relationships::RelationshipCache;
use crate::status::StatusStore;

/// An open status session: registered for friend notices.
pub struct StatusSession {
    pub(crate) user: UserId,
    pub(crate) handle: ConnectionHandle,
    pub(crate) outbound: mpsc::Receiver<String>,
}

impl StatusSession {
    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn session_id(&self) -> SessionId {
        self.handle.session_id()
    }
}

/// An open party session. Its poller stops when the session is dropped.
pub struct PartySession {
    pub(crate) party: PartyId,
    pub(crate) user: UserId,
    pub(crate) reply: ConnectionHandle,
    pub(crate) outbound: mpsc::Receiver<String>,
    pub(crate) poller: JoinHandle<()>,
    pub(crate) _stop_poller: DropGuard,
}

impl PartySession {
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub online_users: u64,
    pub friend_lists: usize,
    pub parties: usize,
    pub status_sessions: usize,
    pub metrics: PresenceMetricsSnapshot,
}

/// Owns the presence stores and the background workers.
///
/// Built explicitly with [`PresenceEngine::start`] inside a tokio runtime and
/// stopped with [`PresenceEngine::shutdown`].
pub struct PresenceEngine {
    config: PresenceConfig,
    status: Arc<StatusStore>,
    relationships: Arc<RelationshipCache>,
    registry: Arc<ConnectionRegistry>,
    queue: PresenceSender,
    source: Arc<dyn RelationshipSource>,
    metrics: Arc<PresenceMetrics>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU64,
}

impl PresenceEngine {
    /// Builds the stores and spawns the dispatcher and both refresh loops.
    pub fn start(
        config: PresenceConfig,
        source: Arc<dyn RelationshipSource>,
    ) -> Result<Self, PresenceError> {
        config.validate()?;

        let metrics = Arc::new(PresenceMetrics::default());
        let status = Arc::new(StatusStore::new(config.status_ttl, config.status_capacity));
        let relationships = Arc::new(RelationshipCache::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (queue, events) = presence_queue(
            config.queue_capacity,
            config.queue_overflow_wait,
            Arc::clone(&metrics),
        );
        let shutdown = CancellationToken::new();

        let dispatcher = PresenceDispatcher::new(
            Arc::clone(&status),
            Arc::clone(&relationships),
            Arc::clone(&registry),
            Arc::clone(&metrics),
        );
        let mut workers = vec![tokio::spawn(dispatcher.run(events, shutdown.clone()))];
        for (kind, interval) in [
            (RefreshKind::Friends, config.friends_refresh_interval),
            (RefreshKind::Parties, config.party_refresh_interval),
        ] {
            let refresh = RefreshLoop {
                kind,
                interval,
                retry_delay: config.retry_delay_for(interval),
                source: Arc::clone(&source),
                cache: Arc::clone(&relationships),
                metrics: Arc::clone(&metrics),
            };
            workers.push(refresh.spawn(shutdown.clone()));
        }

        info!(
            status_ttl = ?config.status_ttl,
            queue_capacity = config.queue_capacity,
            "presence engine started"
        );

        Ok(Self {
            config,
            status,
            relationships,
            registry,
            queue,
            source,
            metrics,
            shutdown,
            workers: Mutex::new(workers),
            next_session: AtomicU64::new(1),
        })
    }

    /// Enqueues a presence event for `user`. Returns `false` if it was dropped.
    pub async fn submit_heartbeat(&self, user: &UserId) -> bool {
        self.queue
            .submit(PresenceEvent::new(user.clone(), PresenceKind::Heartbeat))
            .await
    }

    /// Registers a status session for `user`, replacing any previous one,
    /// and announces the user as active.
    pub async fn open_status_session(&self, user: UserId) -> Result<StatusSession, PresenceError> {
        if self.shutdown.is_cancelled() {
            return Err(PresenceError::ShutDown);
        }
        let (tx, outbound) = mpsc::channel(self.config.session_outbound_capacity);
        let handle = ConnectionHandle::with_close_token(
            self.next_session_id(),
            tx,
            self.shutdown.child_token(),
        );
        if let Some(previous) = self.registry.register(user.clone(), handle.clone()) {
            info!(user = %user, replaced = previous.session_id(), "status session replaced");
        }
        PresenceMetrics::incr(&self.metrics.sessions_opened);
        self.queue
            .submit(PresenceEvent::new(user.clone(), PresenceKind::Connected))
            .await;
        Ok(StatusSession {
            user,
            handle,
            outbound,
        })
    }

    /// Looks up the caller's membership without side effects.
    pub async fn authorize_party(
        &self,
        party: &PartyId,
        user: &UserId,
    ) -> Result<PartyMembership, PresenceError> {
        if self.shutdown.is_cancelled() {
            return Err(PresenceError::ShutDown);
        }
        let source = Arc::clone(&self.source);
        let (lookup_party, lookup_user) = (party.clone(), user.clone());
        let membership = tokio::task::spawn_blocking(move || {
            source.fetch_party_membership(&lookup_party, &lookup_user)
        })
        .await??;
        membership.ok_or_else(|| PresenceError::NotPartyMember {
            party: party.clone(),
            user: user.clone(),
        })
    }

    /// Announces an authorized member as active and starts the party
    /// snapshot poller.
    pub async fn start_party_session(
        &self,
        membership: PartyMembership,
    ) -> Result<PartySession, PresenceError> {
        if self.shutdown.is_cancelled() {
            return Err(PresenceError::ShutDown);
        }
        let PartyMembership { party, user, .. } = membership;

        self.queue
            .submit(PresenceEvent::new(user.clone(), PresenceKind::Connected))
            .await;

        let (tx, outbound) = mpsc::channel(self.config.session_outbound_capacity);
        let reply = ConnectionHandle::new(self.next_session_id(), tx.clone());
        let stop = self.shutdown.child_token();
        let poller = PartyPoller {
            party: party.clone(),
            viewer: user.clone(),
            interval: self.config.party_poll_interval,
            status: Arc::clone(&self.status),
            relationships: Arc::clone(&self.relationships),
            metrics: Arc::clone(&self.metrics),
        };
        let poller = tokio::spawn(poller.run(tx, stop.clone()));
        PresenceMetrics::incr(&self.metrics.sessions_opened);

        Ok(PartySession {
            party,
            user,
            reply,
            outbound,
            poller,
            _stop_poller: stop.drop_guard(),
        })
    }

    /// [`authorize_party`](Self::authorize_party) followed by
    /// [`start_party_session`](Self::start_party_session).
    pub async fn open_party_session(
        &self,
        party: PartyId,
        user: UserId,
    ) -> Result<PartySession, PresenceError> {
        let membership = self.authorize_party(&party, &user).await?;
        self.start_party_session(membership).await
    }

    /// Deregisters the status session for `user` and tells its driver to
    /// stop. The driver counts the close when it exits.
    pub fn close_session(&self, user: &UserId) -> bool {
        match self.registry.deregister(user) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub(crate) fn end_status_session(&self, user: &UserId, session_id: SessionId) {
        self.registry.deregister_session(user, session_id);
        PresenceMetrics::incr(&self.metrics.sessions_closed);
    }

    pub(crate) fn end_party_session(&self) {
        PresenceMetrics::incr(&self.metrics.sessions_closed);
    }

    /// Runs one friend and one party refresh cycle right away.
    pub async fn refresh_now(&self) -> Result<(usize, usize), PresenceError> {
        let friends = refresh_friends_once(&self.source, &self.relationships).await?;
        let parties = refresh_parties_once(&self.source, &self.relationships).await?;
        Ok((friends, parties))
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    pub fn relationships(&self) -> &RelationshipCache {
        &self.relationships
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics_snapshot(&self) -> PresenceMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            online_users: self.status.approximate_len(),
            friend_lists: self.relationships.friend_list_count(),
            parties: self.relationships.party_count(),
            status_sessions: self.registry.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Signals every worker and session to stop and waits for the workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("presence worker ended abnormally: {err}");
            }
        }
        info!("presence engine stopped");
    }

    fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}
