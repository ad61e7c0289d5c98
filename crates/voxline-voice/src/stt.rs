use crate::config::SttConfig;
use crate::error::TranscriptionError;
use crate::service::{AudioFrame, TranscriptResult, TranscriptionService, TranscriptionStream};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use voxline_types::TranscriptionConfig;

/// Maximum audio input size for one recognition segment (10 MiB).
const MAX_SEGMENT_BYTES: usize = 10 * 1024 * 1024;

/// Capacity of the per-connection frame and result channels.
const CONNECTION_CHANNEL_CAPACITY: usize = 32;

/// Streaming transcription built on a whisper.cpp-style batch binary.
///
/// Each open connection accumulates audio until `segment_bytes` are
/// buffered, then runs the binary over that segment and emits the output as
/// a final result. The binary does not report confidence, so results carry
/// `1.0`. Keepalive frames are discarded.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    model_path: PathBuf,
    binary_path: PathBuf,
    segment_bytes: usize,
    timeout: Duration,
}

impl CommandTranscriber {
    pub fn new(config: &SttConfig) -> Self {
        Self {
            model_path: PathBuf::from(&config.model_path),
            binary_path: PathBuf::from(&config.binary_path),
            segment_bytes: config.segment_bytes.clamp(1, MAX_SEGMENT_BYTES),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Runs the binary over one segment of audio.
    ///
    /// A timeout is reported as transient; a binary that cannot be spawned or
    /// exits unsuccessfully is fatal.
    pub async fn recognize_segment(&self, audio_data: &[u8]) -> Result<String, TranscriptionError> {
        if audio_data.len() > MAX_SEGMENT_BYTES {
            return Err(TranscriptionError::Fatal(format!(
                "audio segment exceeds maximum size: {} bytes (limit: {} bytes)",
                audio_data.len(),
                MAX_SEGMENT_BYTES
            )));
        }

        let mut command = Command::new(&self.binary_path);
        // -m <model>, -f - (read from stdin); stdout carries the transcript.
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            TranscriptionError::Fatal(format!("failed to spawn STT binary: {}", e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscriptionError::Fatal("failed to open stdin".to_string()))?;

        stdin
            .write_all(audio_data)
            .await
            .map_err(|e| TranscriptionError::Fatal(format!("failed to write to stdin: {}", e)))?;
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                TranscriptionError::Transient(format!(
                    "STT process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| TranscriptionError::Fatal(format!("failed to read stdout: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscriptionError::Fatal(format!(
                "STT binary failed: {}",
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_connection(
        self,
        mut frames: mpsc::Receiver<AudioFrame>,
        results: mpsc::Sender<Result<TranscriptResult, TranscriptionError>>,
    ) {
        let mut segment: Vec<u8> = Vec::with_capacity(self.segment_bytes);

        while let Some(frame) = frames.recv().await {
            let AudioFrame::Audio(bytes) = frame else {
                continue;
            };
            segment.extend_from_slice(&bytes);
            if segment.len() < self.segment_bytes {
                continue;
            }
            let audio = std::mem::take(&mut segment);
            if !self.emit(&audio, &results).await {
                return;
            }
        }

        if !segment.is_empty() {
            self.emit(&segment, &results).await;
        }
    }

    /// Recognises one segment and forwards the outcome. Returns false when
    /// the connection must end.
    async fn emit(
        &self,
        audio: &[u8],
        results: &mpsc::Sender<Result<TranscriptResult, TranscriptionError>>,
    ) -> bool {
        match self.recognize_segment(audio).await {
            Ok(text) if text.is_empty() => true,
            Ok(text) => results
                .send(Ok(TranscriptResult::final_result(text, 1.0)))
                .await
                .is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "segment recognition failed");
                let _ = results.send(Err(e)).await;
                false
            }
        }
    }
}

#[async_trait]
impl TranscriptionService for CommandTranscriber {
    async fn open_stream(
        &self,
        config: &TranscriptionConfig,
    ) -> Result<TranscriptionStream, TranscriptionError> {
        if self.binary_path.components().count() > 1 && !self.binary_path.exists() {
            return Err(TranscriptionError::Fatal(format!(
                "STT binary not found: {:?}",
                self.binary_path
            )));
        }

        tracing::debug!(
            binary = ?self.binary_path,
            language = %config.language_code,
            sample_rate_hz = config.sample_rate_hz,
            "opening subprocess transcription connection"
        );

        let (audio_tx, audio_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let (results_tx, results_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        tokio::spawn(self.clone().run_connection(audio_rx, results_tx));

        Ok(TranscriptionStream {
            audio: audio_tx,
            results: results_rx,
        })
    }
}
