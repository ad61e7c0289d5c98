//! Observer wire protocol.
//!
//! Every frame in either direction is a JSON envelope `{type, data}`.
//! Server frames are modelled by [`ServerEvent`]; client frames are parsed
//! into [`ClientMessage`] by [`ClientMessage::parse`], which keeps unknown
//! types distinguishable from malformed JSON.

use crate::{now_millis, ParseTopicError, Topic, TopicKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authenticated principal echoed back in `connection_established`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalInfo {
    pub uid: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub client_id: String,
    pub user: PrincipalInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomAck {
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    pub transcript: String,
    pub confidence: f32,
    pub is_final: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub text: String,
    /// Base64-encoded synthesized audio. Empty when synthesis failed.
    pub audio: String,
    pub timestamp: i64,
}

/// Summary of a finished stream, as published in `stream_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: String,
    pub session_id: String,
    pub turn_count: usize,
    pub duration_ms: u64,
    /// Why the stream ended: `completed`, `timeout`, `transport_closed`, ...
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEndPayload {
    pub summary: StreamSummary,
    /// Stream duration in milliseconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub timestamp: i64,
}

/// Frames sent from the server to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished(ConnectionEstablished),
    SubscriptionConfirmed(RoomAck),
    UnsubscriptionConfirmed(RoomAck),
    Transcription(TranscriptionPayload),
    Response(ResponsePayload),
    StreamEnd(StreamEndPayload),
    Error(ErrorPayload),
    InterviewUpdate(Value),
    CallUpdate(Value),
    VoiceAgentMessage(Value),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            error: message.into(),
            timestamp: now_millis(),
        })
    }

    /// The `type` tag this event carries on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => "connection_established",
            Self::SubscriptionConfirmed(_) => "subscription_confirmed",
            Self::UnsubscriptionConfirmed(_) => "unsubscription_confirmed",
            Self::Transcription(_) => "transcription",
            Self::Response(_) => "response",
            Self::StreamEnd(_) => "stream_end",
            Self::Error(_) => "error",
            Self::InterviewUpdate(_) => "interview_update",
            Self::CallUpdate(_) => "call_update",
            Self::VoiceAgentMessage(_) => "voice_agent_message",
        }
    }

    /// Wraps a client-supplied update payload as the event rebroadcast to
    /// its topic, stamping it with the server time.
    pub fn rebroadcast(kind: TopicKind, mut data: Value) -> Self {
        if let Value::Object(map) = &mut data {
            map.insert("timestamp".to_string(), Value::from(now_millis()));
        }
        match kind {
            TopicKind::Interview => Self::InterviewUpdate(data),
            TopicKind::Call => Self::CallUpdate(data),
            TopicKind::VoiceAgent => Self::VoiceAgentMessage(data),
        }
    }
}

/// Why a client frame could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Invalid message format")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown message type")]
    UnknownType(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    InvalidTopic(#[from] ParseTopicError),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Frames sent from observers to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe { room: String },
    Unsubscribe { room: String },
    /// An `interview_update`, `call_update` or `voice_agent_message` to be
    /// rebroadcast to `<kind>:<id>`.
    Update { topic: Topic, data: Value },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "subscribe" => Ok(Self::Subscribe {
                room: room_field(&envelope.data)?,
            }),
            "unsubscribe" => Ok(Self::Unsubscribe {
                room: room_field(&envelope.data)?,
            }),
            "interview_update" => Self::update(TopicKind::Interview, envelope.data),
            "call_update" => Self::update(TopicKind::Call, envelope.data),
            "voice_agent_message" => Self::update(TopicKind::VoiceAgent, envelope.data),
            other => Err(WireError::UnknownType(other.to_string())),
        }
    }

    fn update(kind: TopicKind, data: Value) -> Result<Self, WireError> {
        let id = match data.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(WireError::MissingField("id")),
        };
        Ok(Self::Update {
            topic: Topic::new(kind, id),
            data,
        })
    }
}

/// Rooms must be well-formed `<kind>:<id>` topics.
fn room_field(data: &Value) -> Result<String, WireError> {
    match data.get("room").and_then(Value::as_str) {
        Some(room) if !room.is_empty() => Ok(room.parse::<Topic>()?.to_string()),
        _ => Err(WireError::MissingField("room")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_event_uses_type_data_envelope() {
        let event = ServerEvent::SubscriptionConfirmed(RoomAck {
            room: "call:42".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "subscription_confirmed");
        assert_eq!(json["data"]["room"], "call:42");
    }

    #[test]
    fn transcription_payload_is_camel_case() {
        let event = ServerEvent::Transcription(TranscriptionPayload {
            transcript: "hello".to_string(),
            confidence: 0.9,
            is_final: true,
            timestamp: 1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transcription");
        assert_eq!(json["data"]["transcript"], "hello");
        assert_eq!(json["data"]["isFinal"], true);
        assert!(json["data"].get("is_final").is_none());
        assert_eq!(event.kind(), "transcription");
    }

    #[test]
    fn parse_subscribe_and_unsubscribe() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe","data":{"room":"call:42"}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                room: "call:42".to_string()
            }
        );
        let msg = ClientMessage::parse(r#"{"type":"unsubscribe","data":{"room":"call:42"}}"#)
            .unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe { .. }));
    }

    #[test]
    fn parse_rejects_rooms_outside_known_topics() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"subscribe","data":{"room":"lobby"}}"#),
            Err(WireError::InvalidTopic(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"unsubscribe","data":{"room":"chat:1"}}"#),
            Err(WireError::InvalidTopic(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"subscribe","data":{}}"#),
            Err(WireError::MissingField("room"))
        ));
    }

    #[test]
    fn parse_update_targets_topic_by_id() {
        let msg = ClientMessage::parse(
            r#"{"type":"call_update","data":{"id":42,"status":"ringing"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Update { topic, data } => {
                assert_eq!(topic.to_string(), "call:42");
                assert_eq!(data["status"], "ringing");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parse_distinguishes_unknown_from_malformed() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"dance","data":{}}"#),
            Err(WireError::UnknownType(t)) if t == "dance"
        ));
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(WireError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"subscribe","data":{}}"#),
            Err(WireError::MissingField("room"))
        ));
    }

    #[test]
    fn rebroadcast_stamps_timestamp() {
        let event = ServerEvent::rebroadcast(TopicKind::Interview, json!({"id": "i-1"}));
        match event {
            ServerEvent::InterviewUpdate(data) => {
                assert_eq!(data["id"], "i-1");
                assert!(data["timestamp"].as_i64().unwrap() > 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
