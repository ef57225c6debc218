//! JSON wire protocol between clients, the relay, and the bus.
//!
//! Three frame shapes travel the wire, all JSON text:
//!
//! ```text
//! client → relay   {"type":"update","room":R,"clientId":C,"update":<base64>}
//! relay  → client  {"type":"sync","action":"snapshot","update":<base64>}
//! relay  → client  {"type":"sync","action":"update","update":<base64>,
//!                   "originInstance":I}
//! relay  ↔ bus     {"instanceId":I,"room":R,"update":<base64>}
//! ```
//!
//! Update payloads are opaque CRDT blobs, base64-encoded for transport.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidBase64(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidBase64(e) => write!(f, "invalid base64 payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Base64-encode an update blob for transport.
pub fn encode_update(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 update payload back to bytes.
pub fn decode_update(text: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(text.as_bytes())
        .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))
}

/// Inbound client frame.
///
/// Only `type == "update"` with a non-empty `update` field is processed;
/// everything else is ignored. The `room` field is informational — routing
/// uses the room the socket joined at handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
}

impl ClientFrame {
    /// Create an update frame.
    pub fn update(
        room: impl Into<String>,
        client_id: impl Into<String>,
        update: impl Into<String>,
    ) -> Self {
        Self {
            kind: "update".to_string(),
            room: Some(room.into()),
            client_id: Some(client_id.into()),
            update: Some(update.into()),
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Outbound sync frame, sent to client sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub update: String,
    #[serde(
        rename = "originInstance",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_instance: Option<String>,
}

impl SyncFrame {
    /// The initial full-state frame sent when a client joins.
    pub fn snapshot(update: impl Into<String>) -> Self {
        Self {
            kind: "sync".to_string(),
            action: "snapshot".to_string(),
            update: update.into(),
            origin_instance: None,
        }
    }

    /// An incremental update frame, tagged with the instance it came from.
    pub fn update(update: impl Into<String>, origin_instance: impl Into<String>) -> Self {
        Self {
            kind: "sync".to_string(),
            action: "update".to_string(),
            update: update.into(),
            origin_instance: Some(origin_instance.into()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Cross-instance bus message, published on channel `room:{roomId}`.
///
/// The `instance_id` tag is the only echo-suppression mechanism: an
/// instance drops envelopes carrying its own id on ingress, which is what
/// prevents an unbounded publish/receive cycle across instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEnvelope {
    pub instance_id: String,
    pub room: String,
    pub update: String,
}

impl BusEnvelope {
    pub fn new(
        instance_id: impl Into<String>,
        room: impl Into<String>,
        update: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            room: room.into(),
            update: update.into(),
        }
    }

    /// The bus channel for a room.
    pub fn channel(room: &str) -> String {
        format!("room:{room}")
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_roundtrip() {
        let frame = ClientFrame::update("design-review", "client-7", "AQID");
        let encoded = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, "update");
        assert_eq!(decoded.room.as_deref(), Some("design-review"));
        assert_eq!(decoded.client_id.as_deref(), Some("client-7"));
        assert_eq!(decoded.update.as_deref(), Some("AQID"));
    }

    #[test]
    fn test_client_frame_field_names_match_wire_contract() {
        let encoded = ClientFrame::update("r", "c", "u").encode().unwrap();
        assert!(encoded.contains("\"type\":\"update\""));
        assert!(encoded.contains("\"clientId\":\"c\""));
    }

    #[test]
    fn test_unknown_client_frame_still_decodes() {
        let decoded = ClientFrame::decode(r#"{"type":"presence","cursor":5}"#).unwrap();
        assert_eq!(decoded.kind, "presence");
        assert!(decoded.update.is_none());
    }

    #[test]
    fn test_malformed_client_frame_errors() {
        assert!(ClientFrame::decode("not json").is_err());
        assert!(ClientFrame::decode(r#"{"room":"r"}"#).is_err());
    }

    #[test]
    fn test_snapshot_frame_has_no_origin() {
        let encoded = SyncFrame::snapshot("AQID").encode().unwrap();
        assert!(encoded.contains("\"action\":\"snapshot\""));
        assert!(!encoded.contains("originInstance"));
    }

    #[test]
    fn test_update_frame_roundtrip() {
        let frame = SyncFrame::update("AQID", "instance-1");
        let decoded = SyncFrame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, "sync");
        assert_eq!(decoded.action, "update");
        assert_eq!(decoded.origin_instance.as_deref(), Some("instance-1"));
    }

    #[test]
    fn test_bus_envelope_roundtrip() {
        let envelope = BusEnvelope::new("instance-1", "design-review", "AQID");
        let encoded = envelope.encode().unwrap();
        assert!(encoded.contains("\"instanceId\":\"instance-1\""));

        let decoded = BusEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_bus_channel_name() {
        assert_eq!(BusEnvelope::channel("r1"), "room:r1");
    }

    #[test]
    fn test_update_base64_roundtrip() {
        let bytes = vec![0u8, 1, 2, 255];
        let decoded = decode_update(&encode_update(&bytes)).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn test_invalid_base64_errors() {
        assert!(matches!(
            decode_update("not base64!!!"),
            Err(ProtocolError::InvalidBase64(_))
        ));
    }
}
