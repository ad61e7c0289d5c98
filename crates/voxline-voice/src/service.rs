use crate::error::{TranscriptionError, VoiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use voxline_types::{TranscriptionConfig, Turn, VoiceOptions};

/// A frame written to a transcription connection.
///
/// Keepalives are a distinct variant so a liveness signal can never be
/// mistaken for (empty) audio by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFrame {
    Audio(Vec<u8>),
    KeepAlive,
}

/// One recognition result from a transcription connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    pub transcript: String,
    pub is_final: bool,
    pub confidence: f32,
}

impl TranscriptResult {
    pub fn partial(transcript: impl Into<String>, confidence: f32) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: false,
            confidence,
        }
    }

    pub fn final_result(transcript: impl Into<String>, confidence: f32) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: true,
            confidence,
        }
    }
}

/// Both halves of an open transcription connection.
///
/// Writing is done through `audio`; results (or a classified error) arrive
/// on `results`. Dropping the stream closes the connection.
#[derive(Debug)]
pub struct TranscriptionStream {
    pub audio: mpsc::Sender<AudioFrame>,
    pub results: mpsc::Receiver<Result<TranscriptResult, TranscriptionError>>,
}

/// Streaming speech-to-text.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Opens a new connection bound to one audio stream.
    async fn open_stream(
        &self,
        config: &TranscriptionConfig,
    ) -> Result<TranscriptionStream, TranscriptionError>;
}

/// Stateless text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns encoded audio for `text`.
    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError>;
}

/// Everything the dialogue engine is told about one user utterance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueRequest {
    pub session_id: String,
    pub utterance: String,
    pub persona: String,
    pub metadata: BTreeMap<String, String>,
    pub history: Vec<Turn>,
}

/// The engine's answer: reply text plus any context updates.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DialogueReply {
    pub text: String,
    /// Metadata keys to merge into the session's conversation context.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

/// Language-model reply generation.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    async fn generate_reply(&self, request: &DialogueRequest) -> Result<DialogueReply, VoiceError>;
}
