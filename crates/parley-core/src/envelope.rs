//! The wire envelope and its codec.
//!
//! Every frame exchanged over a Parley connection decodes to an
//! [`Envelope`]. Decoders ignore unknown fields (forward compatibility);
//! missing required fields produce a [`CodecError`], never a panic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EnvelopeId, GroupId};
use crate::protocol;

/// Which side of the connection produced an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Produced by the browser-resident client.
    Client,
    /// Produced by the server.
    Server,
}

/// The unit of wire exchange.
///
/// `kind` is private: router dispatch is a pure function of the kind, so
/// it is immutable once the envelope is constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Opaque unique token, client- or server-generated.
    pub id: EnvelopeId,
    /// Hierarchical message type, e.g. `system.ping`.
    #[serde(rename = "type")]
    kind: String,
    /// Protocol version string.
    pub version: String,
    /// Instant with sub-second precision (RFC3339 on the wire).
    pub timestamp: DateTime<Utc>,
    /// Which side produced the envelope.
    pub origin: Origin,
    /// Session group, absent for connection-scoped system messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    /// Server outbound sequence number, absent on client envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Type-specific structured data, opaque to the router.
    #[serde(default)]
    pub payload: Value,
}

/// Envelope (de)serialization failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame was not a valid envelope (malformed JSON or a missing
    /// required field).
    #[error("invalid envelope: {0}")]
    Decode(#[source] serde_json::Error),
    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Envelope {
    fn new(origin: Origin, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind: kind.into(),
            version: protocol::PROTOCOL_VERSION.to_owned(),
            timestamp: Utc::now(),
            origin,
            group_id: None,
            sequence: None,
            payload,
        }
    }

    /// Build a client-origin envelope.
    #[must_use]
    pub fn client(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(Origin::Client, kind, payload)
    }

    /// Build a server-origin envelope.
    #[must_use]
    pub fn server(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(Origin::Server, kind, payload)
    }

    /// Attach a session group.
    #[must_use]
    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group_id = Some(group);
        self
    }

    /// The hierarchical message type. Immutable once set.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether this envelope belongs to the `system` plane.
    #[must_use]
    pub fn is_system(&self) -> bool {
        protocol::is_system(&self.kind)
    }

    /// Decode a text frame into an envelope.
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        serde_json::from_str(frame).map_err(CodecError::Decode)
    }

    /// Encode this envelope as a text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_envelope_defaults() {
        let env = Envelope::server(protocol::SYSTEM_PING, json!({}));
        assert_eq!(env.kind(), "system.ping");
        assert_eq!(env.origin, Origin::Server);
        assert_eq!(env.version, protocol::PROTOCOL_VERSION);
        assert!(env.group_id.is_none());
        assert!(env.sequence.is_none());
    }

    #[test]
    fn with_group_sets_group() {
        let env = Envelope::client("chat.message.send", json!({"text": "hi"}))
            .with_group(GroupId::from("conv_1"));
        assert_eq!(env.group_id.as_ref().unwrap().as_str(), "conv_1");
    }

    #[test]
    fn encode_decode_round_trip() {
        let env = Envelope::server(protocol::SYSTEM_PONG, json!({"t": 1}))
            .with_group(GroupId::from("g1"));
        let frame = env.encode().unwrap();
        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back.kind(), env.kind());
        assert_eq!(back.id, env.id);
        assert_eq!(back.origin, Origin::Server);
        assert_eq!(back.group_id, env.group_id);
        assert_eq!(back.payload["t"], 1);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let mut env = Envelope::server("system.ping", json!({}));
        env.group_id = Some(GroupId::from("g"));
        env.sequence = Some(7);
        let frame = env.encode().unwrap();
        let raw: Value = serde_json::from_str(&frame).unwrap();
        assert!(raw.get("type").is_some());
        assert!(raw.get("groupId").is_some());
        assert!(raw.get("sequence").is_some());
        assert!(raw.get("kind").is_none());
        assert!(raw.get("group_id").is_none());
    }

    #[test]
    fn timestamp_has_subsecond_precision() {
        let env = Envelope::server("system.ping", json!({}));
        let frame = env.encode().unwrap();
        let raw: Value = serde_json::from_str(&frame).unwrap();
        let ts = raw["timestamp"].as_str().unwrap();
        assert!(ts.contains('.'), "timestamp must carry sub-second digits: {ts}");
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let frame = r#"{
            "id": "e1",
            "type": "system.ping",
            "version": "1",
            "timestamp": "2026-08-07T00:00:00.000Z",
            "origin": "server",
            "futureField": {"nested": true},
            "payload": {}
        }"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.kind(), "system.ping");
    }

    #[test]
    fn decode_missing_required_field_fails() {
        // No "type" field.
        let frame = r#"{
            "id": "e1",
            "version": "1",
            "timestamp": "2026-08-07T00:00:00.000Z",
            "origin": "client",
            "payload": {}
        }"#;
        let err = Envelope::decode(frame).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn decode_missing_payload_defaults_to_null() {
        let frame = r#"{
            "id": "e2",
            "type": "system.pong",
            "version": "1",
            "timestamp": "2026-08-07T00:00:00.000Z",
            "origin": "client"
        }"#;
        let env = Envelope::decode(frame).unwrap();
        assert!(env.payload.is_null());
    }

    #[test]
    fn decode_garbage_fails_without_panicking() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode("").is_err());
        assert!(Envelope::decode("[1,2,3]").is_err());
    }

    #[test]
    fn origin_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Origin::Client).unwrap(), "\"client\"");
        assert_eq!(serde_json::to_string(&Origin::Server).unwrap(), "\"server\"");
    }

    #[test]
    fn is_system_classification() {
        assert!(Envelope::server(protocol::SYSTEM_ERROR, json!({})).is_system());
        assert!(!Envelope::client("chat.message.send", json!({})).is_system());
    }
}
