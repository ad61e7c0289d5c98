//! Error types for the stream pipeline.

use voxline_voice::TranscriptionError;

/// Errors surfaced by [`StreamPipeline`](crate::StreamPipeline) operations.
///
/// "Not found" on status and stop queries is not an error: those return
/// `Option::None`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The audio source cannot be read as described.
    #[error("invalid transport: {0}")]
    InvalidTransport(String),

    /// A stream with this id is already running.
    #[error("stream already active: {0}")]
    AlreadyActive(String),

    /// The transcription connection could not be established.
    #[error("transcription adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Retryable transcription failure (idle disconnect, timeout).
    #[error("transient adapter error: {0}")]
    TransientAdapterError(String),

    /// Non-retryable transcription failure.
    #[error("fatal adapter error: {0}")]
    FatalAdapterError(String),

    /// The session buffer would exceed its cap.
    #[error("audio buffer overflow: {buffered} bytes buffered, cap is {cap}")]
    BufferOverflow { buffered: usize, cap: usize },

    /// No live stream with this id.
    #[error("stream not found: {0}")]
    NotFound(String),
}

impl From<TranscriptionError> for PipelineError {
    fn from(err: TranscriptionError) -> Self {
        match err {
            TranscriptionError::Transient(msg) => Self::TransientAdapterError(msg),
            TranscriptionError::Fatal(msg) => Self::FatalAdapterError(msg),
        }
    }
}
