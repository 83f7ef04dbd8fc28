//! Presence events reported by the relay

use crate::participant::{Participant, PeerId};
use serde::{Deserialize, Serialize};

/// Roster change as seen by one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PresenceEvent {
    /// A participant entered the session
    Join {
        /// The new member
        participant: Participant,
    },
    /// A participant left cleanly
    Leave {
        /// Id of the departed member
        id: PeerId,
    },
    /// Full roster snapshot; anyone absent is gone
    Sync {
        /// Every current member, possibly including the receiver
        members: Vec<Participant>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_wire_format() {
        let join = PresenceEvent::Join {
            participant: Participant::new("bob", "Bob").with_joined_at(7),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"event": "join", "participant": {"id": "bob", "displayName": "Bob", "joinedAt": 7}})
        );

        let leave: PresenceEvent =
            serde_json::from_value(json!({"event": "leave", "id": "bob"})).unwrap();
        assert_eq!(leave, PresenceEvent::Leave { id: "bob".to_string() });
    }

    #[test]
    fn test_join_without_display_name() {
        let join: PresenceEvent = serde_json::from_value(
            json!({"event": "join", "participant": {"id": "carol", "joinedAt": 9}}),
        )
        .unwrap();
        match join {
            PresenceEvent::Join { participant } => {
                assert_eq!(participant.id, "carol");
                assert_eq!(participant.joined_at, 9);
                assert!(participant.display_name.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
