//! Shared types for the voxline voice-conversation pipeline.
//!
//! This crate provides the foundational types used across all voxline
//! crates: the stream lifecycle states, conversation turns, topic naming,
//! voice and transcription options, and the observer wire protocol.
//!
//! It performs no I/O. Every other crate in the workspace depends on it for
//! cross-cutting type definitions, which keeps the dependency graph acyclic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod voice;
pub mod wire;

pub use voice::{AudioEncoding, TranscriptionConfig, VoiceOptions};
pub use wire::{
    ClientMessage, ConnectionEstablished, ErrorPayload, PrincipalInfo, ResponsePayload, RoomAck,
    ServerEvent, StreamEndPayload, StreamSummary, TranscriptionPayload, WireError,
};

/// Lifecycle state of one audio stream.
///
/// A stream has exactly one authoritative state at any time. Legal moves
/// are given by [`StreamState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// Resources are being allocated; no audio is accepted yet.
    Starting,
    /// Transcription connection is healthy and audio flows.
    Active,
    /// Transcription connection dropped with a transient error and is
    /// being re-established. Audio keeps accumulating in the buffer.
    Recovering,
    /// Teardown in progress. Further audio and transcripts are dropped.
    Stopping,
    /// Terminal state.
    Stopped,
}

impl StreamState {
    /// Returns the canonical label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Active => "ACTIVE",
            Self::Recovering => "RECOVERING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Transition table for the stream state machine.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Starting, Active)
                | (Starting, Stopping)
                | (Active, Recovering)
                | (Active, Stopping)
                | (Recovering, Active)
                | (Recovering, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The caller on the telephony leg.
    User,
    /// The voice agent.
    Agent,
}

/// One entry of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Topic families observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    Interview,
    Call,
    VoiceAgent,
}

impl TopicKind {
    /// Returns the topic prefix for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Call => "call",
            Self::VoiceAgent => "voice_agent",
        }
    }
}

/// A fan-out topic name of the form `<kind>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub id: String,
}

impl Topic {
    pub fn new(kind: TopicKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// The topic on which a session's transcript and reply events appear.
    pub fn voice_agent(session_id: impl Into<String>) -> Self {
        Self::new(TopicKind::VoiceAgent, session_id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Error returned when a string is not a well-formed `<kind>:<id>` topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic name: {0}")]
pub struct ParseTopicError(pub String);

impl FromStr for Topic {
    type Err = ParseTopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseTopicError(s.to_string()))?;
        let kind = match kind {
            "interview" => TopicKind::Interview,
            "call" => TopicKind::Call,
            "voice_agent" => TopicKind::VoiceAgent,
            _ => return Err(ParseTopicError(s.to_string())),
        };
        if id.is_empty() {
            return Err(ParseTopicError(s.to_string()));
        }
        Ok(Self::new(kind, id))
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_allows_recovery_cycle() {
        assert!(StreamState::Starting.can_transition_to(StreamState::Active));
        assert!(StreamState::Active.can_transition_to(StreamState::Recovering));
        assert!(StreamState::Recovering.can_transition_to(StreamState::Active));
        assert!(StreamState::Recovering.can_transition_to(StreamState::Stopping));
        assert!(StreamState::Stopping.can_transition_to(StreamState::Stopped));
    }

    #[test]
    fn transition_table_rejects_resurrection() {
        assert!(!StreamState::Stopped.can_transition_to(StreamState::Active));
        assert!(!StreamState::Stopping.can_transition_to(StreamState::Active));
        assert!(!StreamState::Stopping.can_transition_to(StreamState::Recovering));
        assert!(!StreamState::Starting.can_transition_to(StreamState::Recovering));
        assert!(!StreamState::Active.can_transition_to(StreamState::Stopped));
    }

    #[test]
    fn state_labels() {
        assert_eq!(StreamState::Recovering.to_string(), "RECOVERING");
        assert_eq!(
            serde_json::to_value(StreamState::Active).unwrap(),
            serde_json::json!("ACTIVE")
        );
    }

    #[test]
    fn topic_display_and_parse() {
        let topic = Topic::voice_agent("s1");
        assert_eq!(topic.to_string(), "voice_agent:s1");
        assert_eq!("voice_agent:s1".parse::<Topic>().unwrap(), topic);
        assert_eq!(
            "call:42".parse::<Topic>().unwrap(),
            Topic::new(TopicKind::Call, "42")
        );
    }

    #[test]
    fn topic_parse_rejects_unknown_kind_and_empty_id() {
        assert!("lobby:1".parse::<Topic>().is_err());
        assert!("call:".parse::<Topic>().is_err());
        assert!("call".parse::<Topic>().is_err());
    }
}
