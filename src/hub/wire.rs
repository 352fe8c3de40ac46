//! JSON frame types exchanged with a connected device.

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    /// Server -> device: a push notification.
    Message,
    /// Server -> device: heartbeat.
    Ping,
    /// Device -> server: heartbeat reply.
    Pong,
    /// Device -> server: delivery acknowledgement (`id` = message_id).
    Ack,
    /// Device -> server: reserved.
    Register,
}

/// One JSON text frame on the device socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: WireKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WireMessage {
    pub fn message(id: String, data: serde_json::Value) -> Self {
        Self {
            kind: WireKind::Message,
            id: Some(id),
            timestamp: Utc::now().timestamp(),
            data: Some(data),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: WireKind::Ping,
            id: None,
            timestamp: Utc::now().timestamp(),
            data: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_is_lowercase() {
        let frame = WireMessage::ping();
        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"ping""#));
        assert!(!json.contains("data"));
    }

    #[test]
    fn ack_frame_parses() {
        let frame = WireMessage::from_json(r#"{"type":"ack","id":"m-1","timestamp":123}"#).unwrap();
        assert_eq!(frame.kind, WireKind::Ack);
        assert_eq!(frame.id.as_deref(), Some("m-1"));
    }

    #[test]
    fn message_frame_roundtrips_with_data() {
        let frame = WireMessage::message(
            "abc".into(),
            serde_json::json!({"title": "t", "body": "b"}),
        );
        let parsed = WireMessage::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed.kind, WireKind::Message);
        assert_eq!(parsed.data.unwrap()["body"], "b");
    }

    #[test]
    fn unknown_fields_ignored_missing_fields_defaulted() {
        let frame = WireMessage::from_json(r#"{"type":"pong","extra":1}"#).unwrap();
        assert_eq!(frame.kind, WireKind::Pong);
        assert_eq!(frame.timestamp, 0);
        assert!(frame.id.is_none());
    }
}
