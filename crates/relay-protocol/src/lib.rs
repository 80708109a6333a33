//! Wire envelope schema for the agent-relay broker.
//!
//! Every frame on the wire deserializes to a single [`Envelope`]. The byte
//! layout (4-byte big-endian length prefix + UTF-8 JSON body) lives in the
//! `agent-relay` crate's framing codec; this crate only owns the JSON shape.
//!
//! `payload` is kept as a raw [`serde_json::Value`] rather than folded into
//! the `type` tag, matching the wire shape where `type` and `payload` are
//! sibling fields. Typed payload structs are provided for each frame kind;
//! callers deserialize via [`Envelope::payload_as`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version carried in every envelope's `v` field. A HELLO with a
/// mismatched `v` is rejected with `BAD_REQUEST`.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Frame type discriminant
// ---------------------------------------------------------------------------

/// The envelope `type` discriminant.
///
/// `Other` preserves any value this build doesn't recognize, so an
/// unrecognized `type` still round-trips unchanged instead of being
/// rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameType {
    Hello,
    Welcome,
    Send,
    Deliver,
    Ack,
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Bye,
    Error,
    Busy,
    ShadowBind,
    ShadowUnbind,
    Log,
    Other(String),
}

impl FrameType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            FrameType::Hello => "HELLO",
            FrameType::Welcome => "WELCOME",
            FrameType::Send => "SEND",
            FrameType::Deliver => "DELIVER",
            FrameType::Ack => "ACK",
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
            FrameType::Subscribe => "SUBSCRIBE",
            FrameType::Unsubscribe => "UNSUBSCRIBE",
            FrameType::Bye => "BYE",
            FrameType::Error => "ERROR",
            FrameType::Busy => "BUSY",
            FrameType::ShadowBind => "SHADOW_BIND",
            FrameType::ShadowUnbind => "SHADOW_UNBIND",
            FrameType::Log => "LOG",
            FrameType::Other(s) => s,
        }
    }
}

impl From<&str> for FrameType {
    fn from(s: &str) -> Self {
        match s {
            "HELLO" => FrameType::Hello,
            "WELCOME" => FrameType::Welcome,
            "SEND" => FrameType::Send,
            "DELIVER" => FrameType::Deliver,
            "ACK" => FrameType::Ack,
            "PING" => FrameType::Ping,
            "PONG" => FrameType::Pong,
            "SUBSCRIBE" => FrameType::Subscribe,
            "UNSUBSCRIBE" => FrameType::Unsubscribe,
            "BYE" => FrameType::Bye,
            "ERROR" => FrameType::Error,
            "BUSY" => FrameType::Busy,
            "SHADOW_BIND" => FrameType::ShadowBind,
            "SHADOW_UNBIND" => FrameType::ShadowUnbind,
            "LOG" => FrameType::Log,
            other => FrameType::Other(other.to_owned()),
        }
    }
}

impl Serialize for FrameType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FrameType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(FrameType::from(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The envelope carried on every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub id: Uuid,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<serde_json::Value>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
    /// Top-level keys this build doesn't recognize, preserved so a frame
    /// round-trips unchanged even when produced by a newer peer.
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// Build a bare envelope with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(kind: FrameType, payload: serde_json::Value) -> Self {
        Envelope {
            v: PROTOCOL_VERSION,
            kind,
            id: Uuid::new_v4(),
            ts: now_ms(),
            topic: None,
            to: None,
            from: None,
            payload_meta: None,
            payload,
            delivery: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Deserialize `payload` into a typed payload struct.
    ///
    /// # Errors
    /// Returns an error if `payload` doesn't match the requested shape.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }

    /// `v` matches the protocol version this crate implements.
    #[must_use]
    pub fn has_supported_version(&self) -> bool {
        self.v == PROTOCOL_VERSION
    }
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `delivery` field, present only on DELIVER envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub peer: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "originalTo")]
    pub original_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<bool>,
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// `to` value meaning "every registered agent".
pub const BROADCAST_TARGET: &str = "*";

/// Reserved `from` identity used for daemon-synthesized system broadcasts.
pub const SYSTEM_AGENT_NAME: &str = "__system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inflight: Option<u32>,
    #[serde(default)]
    pub supports_topics: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResumeRequest {
    pub resume_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "workingDirectory")]
    pub working_directory: Option<String>,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionResumeRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub max_frame_bytes: u32,
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: String,
    pub resume_token: String,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    Message,
    Thinking,
    Action,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPayload {
    pub kind: SendKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_id: Uuid,
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Frozen error codes. See [`error_codes`] for the canonical string constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub fatal: bool,
}

pub mod error_codes {
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const BAD_FRAME: &str = "BAD_FRAME";
    pub const RESUME_TOO_OLD: &str = "RESUME_TOO_OLD";
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";
    pub const CONNECTION_SUPERSEDED: &str = "CONNECTION_SUPERSEDED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Triggers that permit a shadow agent's own SEND to be forwarded outbound.
/// The router enforces this policy; it never synthesizes shadow speech.
pub mod speak_on_triggers {
    pub const EXPLICIT_ASK: &str = "EXPLICIT_ASK";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowBindPayload {
    #[serde(rename = "primaryAgent")]
    pub primary_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "speakOn")]
    pub speak_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "receiveIncoming")]
    pub receive_incoming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "receiveOutgoing")]
    pub receive_outgoing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowUnbindPayload {
    #[serde(rename = "primaryAgent")]
    pub primary_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topic: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trips_known_variants() {
        for (variant, wire) in [
            (FrameType::Hello, "HELLO"),
            (FrameType::Deliver, "DELIVER"),
            (FrameType::ShadowBind, "SHADOW_BIND"),
        ] {
            assert_eq!(variant.as_str(), wire);
            assert_eq!(FrameType::from(wire), variant);
        }
    }

    #[test]
    fn unknown_frame_type_preserves_original_string() {
        let parsed = FrameType::from("FUTURE_TYPE");
        assert_eq!(parsed, FrameType::Other("FUTURE_TYPE".to_owned()));
        assert_eq!(parsed.as_str(), "FUTURE_TYPE");
    }

    #[test]
    fn envelope_round_trips_through_json_preserving_unknown_type() {
        let json = r#"{
            "v": 1, "type": "FROBNICATE", "id": "11111111-1111-1111-1111-111111111111",
            "ts": 1000, "payload": {"foo": "bar"}
        }"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.kind, FrameType::Other("FROBNICATE".to_owned()));
        let out = serde_json::to_string(&env).unwrap();
        let reparsed: Envelope = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed.kind, env.kind);
        assert_eq!(reparsed.payload, env.payload);
    }

    #[test]
    fn envelope_preserves_unrecognized_top_level_keys() {
        let json = r#"{
            "v": 1, "type": "SEND", "id": "11111111-1111-1111-1111-111111111111",
            "ts": 1000, "payload": {"kind": "message", "body": "hi"},
            "futureField": {"nested": true}
        }"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(
            env.extra.get("futureField"),
            Some(&serde_json::json!({"nested": true}))
        );
        let out = serde_json::to_string(&env).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed["futureField"], serde_json::json!({"nested": true}));
    }

    #[test]
    fn send_payload_round_trips_with_optional_fields_omitted() {
        let env = Envelope::new(
            FrameType::Send,
            serde_json::to_value(SendPayload {
                kind: SendKind::Message,
                body: "hi".to_owned(),
                data: None,
                thread: None,
            })
            .unwrap(),
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"data\""));
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        let payload: SendPayload = parsed.payload_as().unwrap();
        assert_eq!(payload.body, "hi");
    }

    #[test]
    fn hello_payload_rejects_mismatched_version_via_has_supported_version() {
        let mut env = Envelope::new(
            FrameType::Hello,
            serde_json::to_value(HelloPayload {
                agent: "alice".to_owned(),
                cli: None,
                program: None,
                model: None,
                task: None,
                working_directory: None,
                capabilities: Capabilities::default(),
                session: None,
            })
            .unwrap(),
        );
        assert!(env.has_supported_version());
        env.v = 2;
        assert!(!env.has_supported_version());
    }
}
