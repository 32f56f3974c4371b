use thiserror::Error;

use crate::identity::{PartyId, UserId};

/// Failures reported by the durable relationship source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backing store could not be reached or opened.
    #[error("relationship store unavailable: {0}")]
    Unavailable(String),
    /// A query against the backing store failed.
    #[error("relationship query failed: {0}")]
    Query(String),
}

/// Errors surfaced by the presence engine.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("invalid presence config: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("user {user} is not a member of party {party}")]
    NotPartyMember { party: PartyId, user: UserId },
    #[error("presence engine is shut down")]
    ShutDown,
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
