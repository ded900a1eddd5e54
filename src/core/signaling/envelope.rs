//! Signaling envelopes exchanged with the relay.
//!
//! Wire shape: `{"type": "...", "from": "<peer>"?, "uuid": "<peer>"?, "payload": {...}}`.
//! Peer-directed payloads carry `target`; the relay stamps `from` before
//! forwarding. Presence notifications put the subject in the top-level `uuid`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::error::CallError;
use crate::core::identity::PeerId;

// ── Envelope type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalKind {
    Register,
    Registered,
    UserList,
    UserJoined,
    UserOnline,
    UserLeft,
    Offer,
    Answer,
    IceCandidate,
    CallRequest,
    CallAccepted,
    CallRejected,
    CallBusy,
    /// Anything this endpoint does not understand; kept for logging.
    Unknown(String),
}

impl SignalKind {
    pub fn as_str(&self) -> &str {
        match self {
            SignalKind::Register => "register",
            SignalKind::Registered => "registered",
            SignalKind::UserList => "user_list",
            SignalKind::UserJoined => "user_joined",
            SignalKind::UserOnline => "user_online",
            SignalKind::UserLeft => "user_left",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::CallRequest => "call-request",
            SignalKind::CallAccepted => "call-accepted",
            SignalKind::CallRejected => "call-rejected",
            SignalKind::CallBusy => "call-busy",
            SignalKind::Unknown(other) => other,
        }
    }

    /// Types that are addressed to one peer and must name their sender.
    pub fn is_peer_directed(&self) -> bool {
        matches!(
            self,
            SignalKind::Offer
                | SignalKind::Answer
                | SignalKind::IceCandidate
                | SignalKind::CallRequest
                | SignalKind::CallAccepted
                | SignalKind::CallRejected
                | SignalKind::CallBusy
        )
    }
}

impl From<String> for SignalKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "register" => SignalKind::Register,
            "registered" => SignalKind::Registered,
            "user_list" => SignalKind::UserList,
            "user_joined" => SignalKind::UserJoined,
            "user_online" => SignalKind::UserOnline,
            "user_left" => SignalKind::UserLeft,
            "offer" => SignalKind::Offer,
            "answer" => SignalKind::Answer,
            "ice-candidate" => SignalKind::IceCandidate,
            "call-request" => SignalKind::CallRequest,
            "call-accepted" => SignalKind::CallAccepted,
            "call-rejected" => SignalKind::CallRejected,
            "call-busy" => SignalKind::CallBusy,
            _ => SignalKind::Unknown(value),
        }
    }
}

impl From<SignalKind> for String {
    fn from(value: SignalKind) -> Self {
        value.as_str().to_string()
    }
}

// ── Negotiation payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[cfg(test)]
impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescriptionPayload {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserListPayload {
    #[serde(default)]
    pub users: Vec<PeerId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UuidPayload {
    pub uuid: PeerId,
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<PeerId>,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl SignalingEnvelope {
    pub fn new(kind: SignalKind, payload: Value) -> Self {
        Self {
            kind,
            from: None,
            uuid: None,
            payload,
        }
    }

    pub fn register(local: &PeerId) -> Self {
        Self::new(SignalKind::Register, json!({ "uuid": local }))
    }

    /// Build a peer-directed envelope: `body` fields plus `target` and the
    /// local id (mirrors what browser endpoints send).
    pub fn to_peer(kind: SignalKind, local: &PeerId, target: &PeerId, body: Value) -> Self {
        let mut payload = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("target".into(), Value::String(target.clone()));
        payload.insert("uuid".into(), Value::String(local.clone()));
        Self::new(kind, Value::Object(payload))
    }

    pub fn offer(local: &PeerId, target: &PeerId, sdp: &SessionDescription) -> Self {
        Self::to_peer(SignalKind::Offer, local, target, json!({ "sdp": sdp }))
    }

    pub fn answer(local: &PeerId, target: &PeerId, sdp: &SessionDescription) -> Self {
        Self::to_peer(SignalKind::Answer, local, target, json!({ "sdp": sdp }))
    }

    pub fn candidate(local: &PeerId, target: &PeerId, candidate: &IceCandidate) -> Self {
        Self::to_peer(
            SignalKind::IceCandidate,
            local,
            target,
            json!({ "candidate": candidate }),
        )
    }

    pub fn call(kind: SignalKind, local: &PeerId, target: &PeerId) -> Self {
        Self::to_peer(kind, local, target, json!({}))
    }

    /// The peer this envelope is about: `from`, else top-level `uuid`.
    pub fn sender(&self) -> Option<&PeerId> {
        self.from.as_ref().or(self.uuid.as_ref())
    }

    /// `target` inside the payload, if any.
    pub fn target(&self) -> Option<&str> {
        self.payload.get("target").and_then(Value::as_str)
    }

    /// Deserialize the payload into a typed view.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CallError::Protocol(format!("bad {} payload: {e}", self.kind.as_str()))
        })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CallError> {
        serde_json::from_str(text).map_err(|e| CallError::Protocol(format!("bad envelope: {e}")))
    }
}
