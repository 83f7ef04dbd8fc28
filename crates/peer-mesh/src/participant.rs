//! Session participants

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a participant; unique within a session
pub type PeerId = String;

/// A member of a session as reported by presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Unique participant id
    pub id: PeerId,

    /// Human readable name
    #[serde(default)]
    pub display_name: String,

    /// Join time in epoch milliseconds; distinguishes a rejoin under the same id
    pub joined_at: i64,
}

impl Participant {
    /// Create a participant that joined now
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            joined_at: now_millis(),
        }
    }

    /// Override the join timestamp
    pub fn with_joined_at(mut self, joined_at: i64) -> Self {
        self.joined_at = joined_at;
        self
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_wire_format() {
        let p = Participant::new("alice", "Alice").with_joined_at(42);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "alice", "displayName": "Alice", "joinedAt": 42})
        );
    }

    #[test]
    fn test_new_participant_is_timestamped() {
        let p = Participant::new("bob", "Bob");
        assert!(p.joined_at > 0);
    }
}
