//! Wire types exchanged between the hub and agent connections.
//!
//! Kept dependency-light (serde + serde_json only) so an agent-side binary
//! can depend on this crate without pulling in the hub's runtime (axum,
//! tokio-tungstenite, rusqlite, ...).

use serde::{Deserialize, Serialize};

/// A single frame exchanged over an agent's WebSocket connection.
///
/// `payload` carries a JSON object whose shape depends on `frame_type`; it
/// is kept as a raw [`serde_json::Value`] here because the hub dispatches on
/// `frame_type` before attempting to deserialize the payload into one of the
/// typed structs below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub client_id: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Heartbeat,
    HeartbeatAck,
    Command,
    Response,
    Bind,
    BindResult,
    Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub hostname: String,
    pub version: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_fingerprint: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub action: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub metrics: String,
}

impl Frame {
    pub fn new(
        id: impl Into<String>,
        frame_type: FrameType,
        client_id: impl Into<String>,
        payload: impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            id: id.into(),
            frame_type,
            client_id: client_id.into(),
            payload: serde_json::to_value(payload)?,
            timestamp: now_unix(),
            compressed: false,
        })
    }

    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_through_json() {
        let cmd = CommandPayload {
            action: "search_channels".into(),
            data: serde_json::json!({"kw": "x"}),
        };
        let frame = Frame::new("hub-1", FrameType::Command, "A1", cmd).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "hub-1");
        assert_eq!(back.frame_type, FrameType::Command);
        let payload: CommandPayload = back.payload_as().unwrap();
        assert_eq!(payload.action, "search_channels");
    }

    #[test]
    fn compressed_defaults_to_false_and_is_omitted() {
        let frame = Frame::new("id", FrameType::Heartbeat, "A1", serde_json::json!({})).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("compressed"));
    }
}
