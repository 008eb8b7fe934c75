//! Wire envelope for application messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Maximum length of a message kind.
pub const MAX_KIND_LEN: usize = 50;

/// Application message envelope carried through broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Namespaced message type, e.g. `chat.text` or `presence.update`.
    pub kind: String,
    pub payload: serde_json::Value,
    pub sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, sender_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            sender_id,
            room_id: None,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Serialized payload size in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_string(&self.payload)
            .map(|s| s.len())
            .unwrap_or(usize::MAX)
    }

    /// Validate the envelope against the configured payload ceiling.
    ///
    /// Violations are soft: the caller gets a structured error and the
    /// originating connection stays open.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<(), EngineError> {
        if !is_valid_kind(&self.kind) {
            return Err(EngineError::ValidationFailed(format!(
                "invalid message kind: {:?}",
                self.kind
            )));
        }

        let size = self.payload_size();
        if size > max_payload_bytes {
            return Err(EngineError::ValidationFailed(format!(
                "payload size {} exceeds limit {}",
                size, max_payload_bytes
            )));
        }

        if self.timestamp > Utc::now() {
            return Err(EngineError::ValidationFailed(
                "timestamp must not be in the future".to_string(),
            ));
        }

        Ok(())
    }
}

/// Validate a message kind: `[a-z0-9._-]`, 1 to 50 chars.
pub fn is_valid_kind(kind: &str) -> bool {
    if kind.is_empty() || kind.len() > MAX_KIND_LEN {
        return false;
    }

    kind.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_kinds() {
        assert!(is_valid_kind("chat.text"));
        assert!(is_valid_kind("presence_update"));
        assert!(is_valid_kind("v1.events-changed"));
        assert!(is_valid_kind("a"));
    }

    #[test]
    fn test_invalid_kinds() {
        assert!(!is_valid_kind(""));
        assert!(!is_valid_kind("Chat.Text"));
        assert!(!is_valid_kind("chat text"));
        assert!(!is_valid_kind("chat/text"));
        assert!(!is_valid_kind(&"a".repeat(MAX_KIND_LEN + 1)));
    }

    #[test]
    fn test_validate_accepts_well_formed_message() {
        let msg = Message::new("chat.text", json!({"body": "hello"}), Uuid::new_v4())
            .with_room("lobby");
        assert!(msg.validate(1024).is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let msg = Message::new("chat.text", json!({"body": "x".repeat(64)}), Uuid::new_v4());
        let err = msg.validate(16).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[test]
    fn test_validate_rejects_future_timestamp() {
        let mut msg = Message::new("chat.text", json!({}), Uuid::new_v4());
        msg.timestamp = Utc::now() + chrono::Duration::seconds(60);
        let err = msg.validate(1024).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Message::new("chat.text", json!({"body": "hi"}), Uuid::new_v4())
            .with_room("lobby")
            .with_correlation(Uuid::new_v4());
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.kind, msg.kind);
        assert_eq!(decoded.room_id.as_deref(), Some("lobby"));
        assert_eq!(decoded.correlation_id, msg.correlation_id);
    }
}
