//! JSON shapes exchanged over session sockets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::UserId;

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum InboundMessage {
    Ping,
}

/// Server → client frames on a status session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum StatusMessage {
    Pong,
    FriendsOnline { user_name: UserId },
}

impl StatusMessage {
    pub fn to_json(&self) -> String {
        // Only string and unit fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Online members of a party, each mapped to `true`. Offline members are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PartySnapshot(pub BTreeMap<UserId, bool>);

impl PartySnapshot {
    pub fn online(members: impl IntoIterator<Item = UserId>) -> Self {
        Self(members.into_iter().map(|m| (m, true)).collect())
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.0.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

pub fn parse_inbound(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_parses() {
        assert_eq!(
            parse_inbound(r#"{"msg_type":"ping"}"#).unwrap(),
            InboundMessage::Ping
        );
    }

    #[test]
    fn unknown_and_malformed_frames_fail_to_parse() {
        assert!(parse_inbound(r#"{"msg_type":"dance"}"#).is_err());
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"type":"ping"}"#).is_err());
    }

    #[test]
    fn outbound_shapes_match_wire_format() {
        assert_eq!(StatusMessage::Pong.to_json(), r#"{"msg_type":"pong"}"#);
        let notice = StatusMessage::FriendsOnline {
            user_name: UserId::parse("Alice").unwrap(),
        };
        assert_eq!(
            notice.to_json(),
            r#"{"msg_type":"friends_online","user_name":"alice"}"#
        );
    }

    #[test]
    fn party_snapshot_lists_only_online_members() {
        let snapshot = PartySnapshot::online(vec![
            UserId::parse("v").unwrap(),
            UserId::parse("u").unwrap(),
        ]);
        assert_eq!(snapshot.to_json(), r#"{"u":true,"v":true}"#);
        assert_eq!(PartySnapshot::default().to_json(), "{}");
    }
}
