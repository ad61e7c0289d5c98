//! Voice collaborators for the voxline pipeline.
//!
//! The pipeline consumes three external services through the traits in
//! [`service`]:
//!
//! - [`TranscriptionService`]: a streaming speech-to-text connection per
//!   audio stream, fed through a bounded channel of [`AudioFrame`]s and
//!   answering with [`TranscriptResult`]s or classified errors.
//! - [`SpeechSynthesizer`]: stateless text-to-speech.
//! - [`DialogueEngine`]: request/response reply generation keyed by session.
//!
//! Concrete backends are provided for local deployments: a whisper.cpp-style
//! subprocess transcriber ([`CommandTranscriber`]), a piper-style subprocess
//! synthesizer ([`CommandSynthesizer`]) and an HTTP JSON dialogue client
//! ([`HttpDialogueEngine`]).

pub mod config;
pub mod dialogue;
pub mod error;
pub mod service;
pub mod stt;
pub mod tts;

pub use config::{DialogueConfig, SttConfig, TtsConfig};
pub use dialogue::HttpDialogueEngine;
pub use error::{TranscriptionError, VoiceError};
pub use service::{
    AudioFrame, DialogueEngine, DialogueReply, DialogueRequest, SpeechSynthesizer,
    TranscriptResult, TranscriptionService, TranscriptionStream,
};
pub use stt::CommandTranscriber;
pub use tts::CommandSynthesizer;
