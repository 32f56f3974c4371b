use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::identity::UserId;

pub type SessionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session outbound queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
}

/// Writable end of one open push session, plus the token that ends it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session_id: SessionId,
    tx: mpsc::Sender<String>,
    close: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(session_id: SessionId, tx: mpsc::Sender<String>) -> Self {
        Self::with_close_token(session_id, tx, CancellationToken::new())
    }

    pub fn with_close_token(
        session_id: SessionId,
        tx: mpsc::Sender<String>,
        close: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            tx,
            close,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queues a text frame without waiting.
    pub fn try_deliver(&self, frame: String) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Asks the session owning this handle to end.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Resolves once [`ConnectionHandle::close`] was called on any clone.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }
}

/// User → active status session. At most one handle per user; a new
/// registration replaces the previous one.
#[derive(Default)]
pub struct ConnectionRegistry {
    handles: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle that was replaced, if any.
    pub fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut guard = self.handles.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(user, handle)
    }

    pub fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        let guard = self.handles.read().unwrap_or_else(|e| e.into_inner());
        guard.get(user).cloned()
    }

    pub fn deregister(&self, user: &UserId) -> Option<ConnectionHandle> {
        let mut guard = self.handles.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(user)
    }

    /// Removes the entry only while it still belongs to `session_id`.
    pub fn deregister_session(&self, user: &UserId, session_id: SessionId) -> bool {
        let mut guard = self.handles.write().unwrap_or_else(|e| e.into_inner());
        match guard.get(user) {
            Some(handle) if handle.session_id == session_id => {
                guard.remove(user);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
