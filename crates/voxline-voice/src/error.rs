use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Dialogue error: {0}")]
    Dialogue(String),

    #[error("Dialogue transport error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure reported by a transcription connection, classified by whether
/// re-establishing the connection is expected to help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    /// Upstream idle disconnect, timeout or similar; retryable.
    #[error("transient transcription error: {0}")]
    Transient(String),

    /// Anything else; the connection must not be retried.
    #[error("fatal transcription error: {0}")]
    Fatal(String),
}

impl TranscriptionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
