use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CloseReason;
use crate::message::Message;

/// Frames sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    Join {
        room: String,
        #[serde(default)]
        capacity: Option<usize>,
        #[serde(default)]
        private: bool,
    },
    Leave {
        room: String,
    },
    Publish {
        room: String,
        kind: String,
        payload: serde_json::Value,
        #[serde(default)]
        correlation_id: Option<Uuid>,
    },
    Ping,
    Pong,
}

/// Frames sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "message")]
    Message {
        #[serde(flatten)]
        message: Message,
    },
    #[serde(rename = "joined")]
    Joined { room: String },
    #[serde(rename = "left")]
    Left { room: String },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "close")]
    Close { reason: CloseReason },
    #[serde(rename = "shutdown")]
    Shutdown {
        reason: String,
        reconnect_after_secs: u64,
    },
}

impl ServerFrame {
    pub fn message(message: Message) -> Self {
        Self::Message { message }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn close(reason: CloseReason) -> Self {
        Self::Close { reason }
    }

    pub fn shutdown(reason: impl Into<String>, reconnect_after_secs: u64) -> Self {
        Self::Shutdown {
            reason: reason.into(),
            reconnect_after_secs,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_parses_join() {
        let raw = json!({
            "type": "Join",
            "payload": { "room": "lobby", "capacity": 8 }
        })
        .to_string();

        let frame: ClientFrame = serde_json::from_str(&raw).unwrap();
        match frame {
            ClientFrame::Join { room, capacity, private } => {
                assert_eq!(room, "lobby");
                assert_eq!(capacity, Some(8));
                assert!(!private);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_tags() {
        let json = ServerFrame::error("ROOM_FULL", "room lobby is full")
            .to_json()
            .unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("ROOM_FULL"));

        let json = ServerFrame::close(CloseReason::HeartbeatTimeout).to_json().unwrap();
        assert!(json.contains("\"type\":\"close\""));
        assert!(json.contains("heartbeat_timeout"));
    }
}
