use serde::{Deserialize, Serialize};
use std::fmt;

fn default_stt_binary() -> String {
    "whisper-cli".to_string()
}

fn default_stt_model() -> String {
    "models/ggml-base.en.bin".to_string()
}

/// Three seconds of 16 kHz, 16-bit mono audio.
fn default_segment_bytes() -> usize {
    96_000
}

fn default_stt_timeout_seconds() -> u64 {
    30
}

fn default_tts_binary() -> String {
    "piper".to_string()
}

fn default_voices_dir() -> String {
    "assets/voices".to_string()
}

fn default_tts_timeout_seconds() -> u64 {
    60
}

fn default_dialogue_timeout_seconds() -> u64 {
    30
}

/// Settings for the subprocess transcription backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_binary")]
    pub binary_path: String,
    #[serde(default = "default_stt_model")]
    pub model_path: String,
    /// Audio bytes accumulated before a segment is recognised.
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: usize,
    #[serde(default = "default_stt_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            binary_path: default_stt_binary(),
            model_path: default_stt_model(),
            segment_bytes: default_segment_bytes(),
            timeout_seconds: default_stt_timeout_seconds(),
        }
    }
}

/// Settings for the subprocess synthesis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_binary")]
    pub binary_path: String,
    /// Directory holding `<voice_name>.onnx` model files.
    #[serde(default = "default_voices_dir")]
    pub voices_dir: String,
    #[serde(default = "default_tts_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            binary_path: default_tts_binary(),
            voices_dir: default_voices_dir(),
            timeout_seconds: default_tts_timeout_seconds(),
        }
    }
}

/// Settings for the HTTP dialogue engine.
#[derive(Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// URL the engine accepts `POST` requests on. Empty disables it.
    #[serde(default)]
    pub endpoint: String,
    /// Bearer token sent with every request, if set.
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_dialogue_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl fmt::Debug for DialogueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogueConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl DialogueConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: String::new(),
            timeout_seconds: default_dialogue_timeout_seconds(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.endpoint.is_empty()
    }
}
