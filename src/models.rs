use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which transport a device is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Delivered through APNs; requires a provider token.
    Ios,
    /// Delivered through the persistent WebSocket; optionally E2E encrypted.
    Android,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Ios => "ios",
            DeviceKind::Android => "android",
        }
    }
}

/// A registered device.
///
/// `device_key` is the stable identity; `device_token` (iOS) and
/// `public_key` (Android) are mutable attributes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub device_key: String,
    #[sqlx(rename = "device_type")]
    #[serde(rename = "device_type")]
    pub kind: DeviceKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A persisted notification message (one row in the outbox until acked).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub device_id: i64,
    pub message_id: String,
    pub title: String,
    pub body: String,
    #[sqlx(rename = "group_name")]
    #[serde(rename = "group")]
    pub group: String,
    pub icon: String,
    pub url: String,
    pub sound: String,
    pub badge: i64,
    #[serde(skip)]
    pub encrypted_payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
}

/// An incoming push request, after body/query/path merging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sound: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub badge: i64,
    #[serde(default)]
    pub call: bool,
    #[serde(default, rename = "isArchive")]
    pub is_archive: bool,
    #[serde(default)]
    pub delete: bool,
    /// Collapse id forwarded to the provider when non-empty.
    #[serde(default)]
    pub id: String,
}

/// Result of a dispatch attempt that reached a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by a live socket or by the provider (2xx).
    Delivered { message_id: String },
    /// Device offline; persisted to the outbox for replay.
    Queued { message_id: String },
}

impl PushOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            PushOutcome::Delivered { message_id } | PushOutcome::Queued { message_id } => message_id,
        }
    }
}

/// Response envelope for the native push and webhook routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResponse {
    pub fn ok(message_id: String) -> Self {
        Self {
            success: true,
            message_id: Some(message_id),
            error: None,
        }
    }
}

/// Bark-compatible response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarkResponse {
    pub code: i64,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl BarkResponse {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            code: 200,
            message: "success".into(),
            timestamp: Utc::now().timestamp(),
            data,
        }
    }
}
