//! JSON wire formats.
//!
//! Two planes share one peer vocabulary. The control plane is the signaling
//! WebSocket: clients wrap a [`PeerMessage`] in a `signal` envelope and the
//! server fans it out to the other participant together with presence and
//! lifecycle notices ([`ServerMessage`]). Once the data channel is open the
//! same [`PeerMessage`] objects travel over it directly, tagged by `type`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::Role;

pub type MessageId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

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

    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    Invite,
    Accept,
    Decline,
    End,
}

impl fmt::Display for CallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallAction::Invite => "invite",
            CallAction::Accept => "accept",
            CallAction::Decline => "decline",
            CallAction::End => "end",
        })
    }
}

/// Encrypted chat payload. `ciphertext` is base64, `timestamp` unix millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageEnvelope {
    pub message_id: MessageId,
    pub ciphertext: String,
    pub timestamp: i64,
    pub sender_role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    Offer {
        sdp: String,
        #[serde(default)]
        ice_restart: bool,
        /// Identifies the sender's peer connection so a receiver can tell a
        /// renegotiation apart from a freshly rebuilt connection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<Uuid>,
    },
    Answer {
        sdp: String,
    },
    IceCandidate(IceCandidate),
    Message(ChatMessageEnvelope),
    Ack {
        message_id: MessageId,
    },
    Call {
        action: CallAction,
        invite_id: Uuid,
    },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Offer { .. } => "offer",
            PeerMessage::Answer { .. } => "answer",
            PeerMessage::IceCandidate(_) => "ice-candidate",
            PeerMessage::Message(_) => "message",
            PeerMessage::Ack { .. } => "ack",
            PeerMessage::Call { .. } => "call",
        }
    }

    /// Chat traffic never detours through the signaling server.
    pub fn allows_signaling_fallback(&self) -> bool {
        !matches!(self, PeerMessage::Message(_) | PeerMessage::Ack { .. })
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            PeerMessage::Offer { .. } | PeerMessage::Answer { .. } | PeerMessage::IceCandidate(_)
        )
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Splits into the `(signalType, payload)` pair carried by a control
    /// plane `signal` envelope.
    pub fn into_signal(self) -> Result<(String, Value), serde_json::Error> {
        let kind = self.kind().to_owned();
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("type");
        }
        Ok((kind, value))
    }

    pub fn from_signal(signal_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let mut map = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        map.insert("type".into(), Value::String(signal_type.to_owned()));
        serde_json::from_value(Value::Object(map))
    }
}

/// Client to server control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Signal {
        #[serde(rename = "signalType")]
        signal_type: String,
        payload: Value,
        #[serde(rename = "participantId")]
        participant_id: String,
    },
}

/// Server to client control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        #[serde(default)]
        connected_participants: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Signal {
        #[serde(rename = "signalType")]
        signal_type: String,
        #[serde(default)]
        payload: Value,
        sender: String,
    },
    Error {
        message: String,
    },
    SessionClosed,
    SessionExpired,
    SessionDeleted,
    AbuseReported,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn peer_messages_use_kebab_case_tags() {
        let candidate = PeerMessage::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        let value: Value = serde_json::from_str(&candidate.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["sdp_mid"], "0");
        assert_eq!(value["sdp_mline_index"], 0);
    }

    #[test]
    fn offer_defaults_restart_flag_when_missing() {
        let parsed = PeerMessage::from_text(r#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(
            parsed,
            PeerMessage::Offer {
                sdp: "v=0".into(),
                ice_restart: false,
                connection_id: None,
            }
        );
    }

    #[test]
    fn signal_envelope_strips_and_restores_type() {
        let invite_id = Uuid::new_v4();
        let message = PeerMessage::Call {
            action: CallAction::Accept,
            invite_id,
        };
        let (signal_type, payload) = message.clone().into_signal().unwrap();
        assert_eq!(signal_type, "call");
        assert!(payload.get("type").is_none());
        assert_eq!(payload["action"], "accept");

        let restored = PeerMessage::from_signal(&signal_type, payload).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn unknown_signal_type_is_rejected() {
        assert!(PeerMessage::from_signal("screen-share", json!({})).is_err());
    }

    #[test]
    fn chat_traffic_stays_on_data_channel() {
        let ack = PeerMessage::Ack {
            message_id: Uuid::new_v4(),
        };
        assert!(!ack.allows_signaling_fallback());
        let answer = PeerMessage::Answer { sdp: "v=0".into() };
        assert!(answer.allows_signaling_fallback());
        assert!(answer.is_negotiation());
    }

    #[test]
    fn client_signal_serializes_camel_case_fields() {
        let message = ClientMessage::Signal {
            signal_type: "answer".into(),
            payload: json!({"sdp": "v=0"}),
            participant_id: "p-1".into(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "signal",
                "signalType": "answer",
                "payload": {"sdp": "v=0"},
                "participantId": "p-1",
            })
        );
    }

    #[test]
    fn server_messages_parse_with_extra_fields() {
        let status: ServerMessage = serde_json::from_value(json!({
            "type": "status",
            "connected_participants": ["a", "b"],
            "status": "active",
            "expires_at": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(
            status,
            ServerMessage::Status {
                connected_participants: vec!["a".into(), "b".into()],
                status: Some("active".into()),
            }
        );

        let closed: ServerMessage = serde_json::from_str(r#"{"type":"session_closed"}"#).unwrap();
        assert_eq!(closed, ServerMessage::SessionClosed);

        let signal: ServerMessage = serde_json::from_value(json!({
            "type": "signal",
            "signalType": "offer",
            "payload": {"sdp": "v=0", "ice_restart": true},
            "sender": "host-1",
        }))
        .unwrap();
        match signal {
            ServerMessage::Signal {
                signal_type,
                sender,
                ..
            } => {
                assert_eq!(signal_type, "offer");
                assert_eq!(sender, "host-1");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
