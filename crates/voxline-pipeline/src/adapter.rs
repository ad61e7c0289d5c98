//! Session-side handle on a transcription connection.

use crate::error::PipelineError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use voxline_types::TranscriptionConfig;
use voxline_voice::{
    AudioFrame, TranscriptResult, TranscriptionError, TranscriptionService, TranscriptionStream,
};

/// Connection status reported through stream status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Connected,
    Disconnected,
    Closed,
}

/// Result of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// The connection is not accepting more frames right now.
    Busy,
    /// There is no usable connection.
    Closed,
}

/// Owns at most one open [`TranscriptionStream`] and knows how to reopen it.
pub struct TranscriptionAdapter {
    service: Arc<dyn TranscriptionService>,
    config: TranscriptionConfig,
    stream: Option<TranscriptionStream>,
    closed: bool,
}

impl TranscriptionAdapter {
    /// Opens the initial connection, retrying transient failures with a
    /// linear backoff. Gives up after `attempts` tries or on the first fatal
    /// error.
    pub async fn connect(
        service: Arc<dyn TranscriptionService>,
        config: TranscriptionConfig,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self, PipelineError> {
        let attempts = attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match service.open_stream(&config).await {
                Ok(stream) => {
                    return Ok(Self {
                        service,
                        config,
                        stream: Some(stream),
                        closed: false,
                    })
                }
                Err(TranscriptionError::Fatal(msg)) => {
                    return Err(PipelineError::AdapterUnavailable(msg));
                }
                Err(TranscriptionError::Transient(msg)) => {
                    tracing::warn!(attempt, attempts, error = %msg, "transcription connect failed");
                    last_error = msg;
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay * attempt).await;
                    }
                }
            }
        }

        Err(PipelineError::AdapterUnavailable(last_error))
    }

    /// Replaces the current connection with a fresh one. Single attempt.
    pub async fn reconnect(&mut self) -> Result<(), TranscriptionError> {
        self.stream = None;
        if self.closed {
            return Err(TranscriptionError::Fatal("adapter closed".to_string()));
        }
        let stream = self.service.open_stream(&self.config).await?;
        self.stream = Some(stream);
        Ok(())
    }

    pub fn try_write(&self, audio: &[u8]) -> WriteOutcome {
        self.try_send(AudioFrame::Audio(audio.to_vec()))
    }

    pub fn send_keepalive(&self) -> WriteOutcome {
        self.try_send(AudioFrame::KeepAlive)
    }

    fn try_send(&self, frame: AudioFrame) -> WriteOutcome {
        let Some(stream) = &self.stream else {
            return WriteOutcome::Closed;
        };
        match stream.audio.try_send(frame) {
            Ok(()) => WriteOutcome::Accepted,
            Err(TrySendError::Full(_)) => WriteOutcome::Busy,
            Err(TrySendError::Closed(_)) => WriteOutcome::Closed,
        }
    }

    /// Waits for the next result. Pends forever while disconnected; a
    /// connection whose result channel ends is reported as a transient
    /// failure.
    pub async fn next_result(&mut self) -> Result<TranscriptResult, TranscriptionError> {
        match &mut self.stream {
            Some(stream) => stream.results.recv().await.unwrap_or_else(|| {
                Err(TranscriptionError::Transient(
                    "transcription connection closed".to_string(),
                ))
            }),
            None => std::future::pending().await,
        }
    }

    /// Drops the current connection after a failure.
    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    pub fn close(&mut self) {
        self.stream = None;
        self.closed = true;
    }

    pub fn status(&self) -> AdapterStatus {
        if self.closed {
            AdapterStatus::Closed
        } else if self.stream.is_some() {
            AdapterStatus::Connected
        } else {
            AdapterStatus::Disconnected
        }
    }
}
