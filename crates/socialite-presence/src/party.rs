use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::identity::{PartyId, UserId};
use crate::messages::PartySnapshot;
use crate::metrics::PresenceMetrics;
use crate::relationships::RelationshipCache;
use crate::status::StatusStore;

/// Online subset of the party's active members.
///
/// Every member is checked, friend or not; the viewer appears like any other
/// member when online.
pub fn party_snapshot(
    status: &StatusStore,
    relationships: &RelationshipCache,
    party: &PartyId,
) -> PartySnapshot {
    let members = relationships.members_of(party);
    PartySnapshot::online(
        members
            .iter()
            .filter(|member| status.is_online(member))
            .cloned(),
    )
}

pub struct PartyPoller {
    pub party: PartyId,
    pub viewer: UserId,
    pub interval: Duration,
    pub status: Arc<StatusStore>,
    pub relationships: Arc<RelationshipCache>,
    pub metrics: Arc<PresenceMetrics>,
}

impl PartyPoller {
    /// Pushes a snapshot now and on every tick until `outbound` closes or
    /// `cancel` fires.
    pub async fn run(self, outbound: mpsc::Sender<String>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let snapshot = party_snapshot(&self.status, &self.relationships, &self.party);
            let frame = snapshot.to_json();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = outbound.send(frame) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            PresenceMetrics::incr(&self.metrics.party_snapshots_sent);
        }
        debug!(party = %self.party, viewer = %self.viewer, "party poller stopped");
    }
}
