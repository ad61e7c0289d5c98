use crate::config::TtsConfig;
use crate::error::VoiceError;
use crate::service::SpeechSynthesizer;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use voxline_types::VoiceOptions;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Text-to-speech through a piper-style binary.
///
/// The voice name selects `<voices_dir>/<voice_name>.onnx`; the optional
/// `<voice_name>.onnx.json` next to it is passed as the model config.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    voices_dir: PathBuf,
    binary_path: PathBuf,
    timeout: Duration,
}

impl CommandSynthesizer {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            voices_dir: PathBuf::from(&config.voices_dir),
            binary_path: PathBuf::from(&config.binary_path),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    fn model_path(&self, voice_name: &str) -> PathBuf {
        let file = format!("{}.onnx", voice_name);
        if Path::new(&file).is_absolute() {
            PathBuf::from(file)
        } else {
            self.voices_dir.join(file)
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    /// Returns raw PCM audio (s16le at the model's native rate).
    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        if voice.speaking_rate < 0.1 || voice.speaking_rate > 10.0 {
            return Err(VoiceError::Config(
                "Speaking rate must be between 0.1 and 10.0".to_string(),
            ));
        }

        let model_path = self.model_path(&voice.voice_name);
        if !model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        let mut command = Command::new(&self.binary_path);
        command
            .arg("--model")
            .arg(&model_path)
            .arg("--output_raw")
            // Length scale is the inverse of speaking rate.
            .arg("--length_scale")
            .arg((1.0 / voice.speaking_rate).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let config_path = model_path.with_extension("onnx.json");
        if config_path.exists() {
            command.arg("--config").arg(config_path);
        }

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let text_owned = text.to_string();

        // Write from a separate task so a full stdout pipe cannot deadlock us.
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;

        match write_task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr)));
        }

        Ok(output.stdout)
    }
}
