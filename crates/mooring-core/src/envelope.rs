//! JSON message envelopes exchanged between endpoints.
//!
//! Wire format: `{"type": "...", "data": ..., "extra": ...}`
//!
//! `data` carries the application message and is opaque to this layer
//! except for its `id` field, which the session-scoping code rewrites
//! on shared connections. `extra` is side-channel metadata (auth info,
//! progress tokens) that is passed through untouched, apart from the
//! verify-code injection done by the proxy on forwarded requests.

use crate::error::{MooringError, MooringResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Envelope tag. Unknown tags are carried through as extensions so
/// future message kinds survive a round trip through older peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Initialize,
    Message,
    #[serde(untagged)]
    Extension(String),
}

/// The wire-level unit exchanged by all endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Envelope {
    /// The handshake request a client-side endpoint sends first.
    pub fn initialize() -> Self {
        Self {
            kind: EnvelopeKind::Initialize,
            data: None,
            extra: None,
        }
    }

    /// The handshake response carrying the server-assigned client id.
    pub fn initialize_reply(client_id: &str) -> Self {
        Self {
            kind: EnvelopeKind::Initialize,
            data: Some(json!({ "clientId": client_id })),
            extra: None,
        }
    }

    /// An application message envelope.
    pub fn message(data: Value, extra: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            data: Some(data),
            extra,
        }
    }

    /// Whether this envelope is the identity handshake.
    pub fn is_initialize(&self) -> bool {
        self.kind == EnvelopeKind::Initialize
    }

    /// The `data.clientId` of an initialize reply, if present.
    pub fn handshake_client_id(&self) -> Option<&str> {
        if !self.is_initialize() {
            return None;
        }
        self.data.as_ref()?.get("clientId")?.as_str()
    }
}

/// Encode an envelope as a JSON text frame.
pub fn encode(envelope: &Envelope) -> MooringResult<String> {
    serde_json::to_string(envelope).map_err(MooringError::Json)
}

/// Decode a JSON text frame into an envelope.
pub fn decode(text: &str) -> MooringResult<Envelope> {
    serde_json::from_str(text)
        .map_err(|e| MooringError::InvalidMessage(format!("malformed envelope: {e}")))
}

/// Merge a verify code into `extra.authInfo.extra.verifyCode`.
///
/// Existing `extra` content is preserved; only the nested path is
/// created or overwritten. Non-object values along the path are
/// replaced, since the path belongs to this layer.
pub fn inject_verify_code(extra: Option<Value>, code: &str) -> Value {
    let mut extra = match extra {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut auth_info = match extra.remove("authInfo") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut inner = match auth_info.remove("extra") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    inner.insert("verifyCode".to_string(), Value::String(code.to_string()));
    auth_info.insert("extra".to_string(), Value::Object(inner));
    extra.insert("authInfo".to_string(), Value::Object(auth_info));
    Value::Object(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_round_trip() {
        let env = Envelope::initialize();
        let text = encode(&env).unwrap();
        assert_eq!(text, r#"{"type":"initialize"}"#);
        assert_eq!(decode(&text).unwrap(), env);
    }

    #[test]
    fn initialize_reply_carries_client_id() {
        let env = Envelope::initialize_reply("c1");
        assert_eq!(env.handshake_client_id(), Some("c1"));

        let text = encode(&env).unwrap();
        let back = decode(&text).unwrap();
        assert_eq!(back.handshake_client_id(), Some("c1"));
    }

    #[test]
    fn message_round_trip_with_extra() {
        let env = Envelope::message(
            json!({"id": 1, "method": "doTask"}),
            Some(json!({"progressToken": "p1"})),
        );
        let back = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.kind, EnvelopeKind::Message);
    }

    #[test]
    fn extension_kind_survives_round_trip() {
        let env = decode(r#"{"type":"heartbeat","data":{"seq":3}}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Extension("heartbeat".to_string()));
        assert!(!env.is_initialize());

        let text = encode(&env).unwrap();
        assert!(text.contains(r#""type":"heartbeat""#));
    }

    #[test]
    fn malformed_envelope_is_invalid_message() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err, MooringError::InvalidMessage(_)));
    }

    #[test]
    fn handshake_client_id_ignores_non_initialize() {
        let env = Envelope::message(json!({"clientId": "nope"}), None);
        assert_eq!(env.handshake_client_id(), None);
    }

    #[test]
    fn inject_verify_code_into_empty_extra() {
        let extra = inject_verify_code(None, "abc123");
        assert_eq!(extra["authInfo"]["extra"]["verifyCode"], "abc123");
    }

    #[test]
    fn inject_verify_code_preserves_existing_extra() {
        let existing = json!({
            "progressToken": "p1",
            "authInfo": { "user": "u1", "extra": { "scope": "all" } }
        });
        let extra = inject_verify_code(Some(existing), "abc123");
        assert_eq!(extra["progressToken"], "p1");
        assert_eq!(extra["authInfo"]["user"], "u1");
        assert_eq!(extra["authInfo"]["extra"]["scope"], "all");
        assert_eq!(extra["authInfo"]["extra"]["verifyCode"], "abc123");
    }

    #[test]
    fn inject_verify_code_replaces_non_object_path() {
        let extra = inject_verify_code(Some(json!({"authInfo": 7})), "x");
        assert_eq!(extra["authInfo"]["extra"]["verifyCode"], "x");
    }
}
