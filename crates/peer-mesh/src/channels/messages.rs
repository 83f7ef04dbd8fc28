//! Application message types
//!
//! Messages are JSON objects tagged by `type`. Chat uses `text-message`;
//! collaborative drawing uses `draw`, `live-draw`, `clear` and `undo`,
//! whose kind-specific fields are carried through untouched.

use crate::participant::now_millis;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum encoded message size accepted from the wire (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

const KNOWN_KINDS: [&str; 5] = ["text-message", "draw", "live-draw", "clear", "undo"];

/// Chat text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    /// Message body
    pub text: String,
    /// Sender id
    pub from: String,
    /// Send time in epoch milliseconds
    pub timestamp: i64,
    /// De-duplication id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Drawing event; stroke data lives in `fields`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawEvent {
    /// Sender id
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Send time in epoch milliseconds
    pub timestamp: i64,
    /// De-duplication id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Kind-specific fields (points, color, width, ...)
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Message carried over a data channel or the broadcast fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppMessage {
    /// Chat text
    TextMessage(TextMessage),
    /// Completed stroke
    Draw(DrawEvent),
    /// In-progress stroke
    LiveDraw(DrawEvent),
    /// Canvas cleared
    Clear(DrawEvent),
    /// Last stroke removed
    Undo(DrawEvent),
}

impl AppMessage {
    /// Create a chat message stamped now
    pub fn text(from: impl Into<String>, text: impl Into<String>) -> Self {
        AppMessage::TextMessage(TextMessage {
            text: text.into(),
            from: from.into(),
            timestamp: now_millis(),
            id: None,
        })
    }

    /// Create a drawing event stamped now
    pub fn drawing(
        kind: DrawKind,
        user_id: impl Into<String>,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let event = DrawEvent {
            user_id: user_id.into(),
            timestamp: now_millis(),
            id: None,
            fields,
        };
        match kind {
            DrawKind::Draw => AppMessage::Draw(event),
            DrawKind::LiveDraw => AppMessage::LiveDraw(event),
            DrawKind::Clear => AppMessage::Clear(event),
            DrawKind::Undo => AppMessage::Undo(event),
        }
    }

    /// Decode a wire value
    ///
    /// Returns `Ok(None)` for a well-formed message of an unknown kind.
    pub fn from_value(value: serde_json::Value) -> Result<Option<Self>> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidData("message without a type".to_string()))?;
        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::InvalidData(format!("malformed {} message: {}", kind, e)))
    }

    /// Decode raw data channel bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidData(format!(
                "message of {} bytes exceeds {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Encode as a JSON value
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Encode as JSON bytes
    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }

    /// Wire kind
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::TextMessage(_) => "text-message",
            AppMessage::Draw(_) => "draw",
            AppMessage::LiveDraw(_) => "live-draw",
            AppMessage::Clear(_) => "clear",
            AppMessage::Undo(_) => "undo",
        }
    }

    /// Sender id (`from` or `userId`)
    pub fn sender(&self) -> &str {
        match self {
            AppMessage::TextMessage(m) => &m.from,
            AppMessage::Draw(e) | AppMessage::LiveDraw(e) | AppMessage::Clear(e) | AppMessage::Undo(e) => {
                &e.user_id
            }
        }
    }

    /// Send timestamp
    pub fn timestamp(&self) -> i64 {
        match self {
            AppMessage::TextMessage(m) => m.timestamp,
            AppMessage::Draw(e) | AppMessage::LiveDraw(e) | AppMessage::Clear(e) | AppMessage::Undo(e) => {
                e.timestamp
            }
        }
    }

    /// De-duplication id, if stamped
    pub fn id(&self) -> Option<&str> {
        match self {
            AppMessage::TextMessage(m) => m.id.as_deref(),
            AppMessage::Draw(e) | AppMessage::LiveDraw(e) | AppMessage::Clear(e) | AppMessage::Undo(e) => {
                e.id.as_deref()
            }
        }
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match self {
            AppMessage::TextMessage(m) => m.id = Some(id),
            AppMessage::Draw(e) | AppMessage::LiveDraw(e) | AppMessage::Clear(e) | AppMessage::Undo(e) => {
                e.id = Some(id)
            }
        }
    }

    /// Key identifying this message across delivery paths
    ///
    /// Only stamped messages can be matched; without an id two events of
    /// the same kind and millisecond are still distinct strokes.
    pub fn dedupe_key(&self) -> Option<&str> {
        self.id()
    }

    /// Character count of chat text; 0 for drawing events
    pub fn text_len(&self) -> usize {
        match self {
            AppMessage::TextMessage(m) => m.text.chars().count(),
            _ => 0,
        }
    }
}

/// Drawing event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawKind {
    /// `draw`
    Draw,
    /// `live-draw`
    LiveDraw,
    /// `clear`
    Clear,
    /// `undo`
    Undo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_message_wire_format() {
        let msg = AppMessage::TextMessage(TextMessage {
            text: "hello".to_string(),
            from: "alice".to_string(),
            timestamp: 1000,
            id: None,
        });
        assert_eq!(
            msg.to_value().unwrap(),
            json!({"type": "text-message", "text": "hello", "from": "alice", "timestamp": 1000})
        );
    }

    #[test]
    fn test_draw_keeps_kind_specific_fields() {
        let raw = json!({
            "type": "draw",
            "userId": "bob",
            "timestamp": 5,
            "points": [[0, 0], [3, 4]],
            "color": "#ff0000"
        });
        let msg = AppMessage::from_value(raw.clone()).unwrap().unwrap();
        assert_eq!(msg.kind(), "draw");
        assert_eq!(msg.sender(), "bob");
        match &msg {
            AppMessage::Draw(e) => assert_eq!(e.fields["color"], json!("#ff0000")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(msg.to_value().unwrap(), raw);
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let raw = json!({"type": "cursor-move", "x": 1});
        assert!(AppMessage::from_value(raw).unwrap().is_none());
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(AppMessage::from_value(json!({"text": "no type"})).is_err());
        assert!(AppMessage::from_value(json!({"type": "text-message", "text": 5})).is_err());
        assert!(AppMessage::from_bytes(b"not json").is_err());
        assert!(AppMessage::from_bytes(&vec![b' '; MAX_MESSAGE_SIZE + 1]).is_err());
    }

    #[test]
    fn test_dedupe_key_requires_id() {
        let mut msg = AppMessage::drawing(DrawKind::Undo, "bob", serde_json::Map::new());
        assert_eq!(msg.dedupe_key(), None);

        msg.set_id("m-1".to_string());
        assert_eq!(msg.dedupe_key(), Some("m-1"));
        assert_eq!(msg.to_value().unwrap()["id"], json!("m-1"));
    }

    #[test]
    fn test_malformed_error_names_kind() {
        let err = AppMessage::from_value(json!({"type": "live-draw", "timestamp": 1})).unwrap_err();
        assert!(err.to_string().contains("malformed live-draw message"));
    }

    #[test]
    fn test_text_len_counts_chars() {
        let msg = AppMessage::text("alice", "héllo");
        assert_eq!(msg.text_len(), 5);
        let decoded = AppMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }
}
