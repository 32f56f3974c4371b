//! Socialite presence engine.
//!
//! Tracks which users are online from their heartbeats, keeps a periodically
//! refreshed copy of the friend and party graph, and pushes "friend online"
//! notices and party snapshots to open sessions.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod party;
pub mod queue;
pub mod refresh;
pub mod registry;
pub mod relationships;
pub mod session;
pub mod status;

pub use config::PresenceConfig;
pub use engine::{PartySession, PresenceEngine, StatusSession};
pub use error::{PresenceError, SourceError};
pub use identity::{PartyId, UserId};
pub use refresh::{MembershipStatus, PartyMembership, RelationshipSource};
