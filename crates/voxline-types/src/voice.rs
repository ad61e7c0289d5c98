//! Voice and transcription option types.
//!
//! `VoiceOptions` describes how a session's replies are spoken;
//! `TranscriptionConfig` describes the inbound audio and how the
//! transcription service should interpret it.

use serde::{Deserialize, Serialize};

/// Encodings the inbound telephony leg may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    /// 16-bit signed little-endian PCM.
    #[default]
    Linear16,
    /// 8-bit G.711 mu-law, as delivered by most telephony media streams.
    Mulaw,
}

/// Per-session synthesis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceOptions {
    /// BCP-47 language tag.
    pub language_code: String,
    /// Engine-specific voice name.
    pub voice_name: String,
    /// Speech speed multiplier (1.0 is normal).
    pub speaking_rate: f32,
    /// Pitch shift in semitones (0.0 is normal).
    pub pitch: f32,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            language_code: "en-US".to_string(),
            voice_name: "en-US-Neural2-F".to_string(),
            speaking_rate: 1.0,
            pitch: 0.0,
        }
    }
}

/// Settings handed to the transcription service when a stream is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionConfig {
    pub encoding: AudioEncoding,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub language_code: String,
    /// Recognition model hint, e.g. `phone_call`.
    pub model: String,
    /// Whether the service should emit partial (non-final) results.
    pub interim_results: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate_hz: 16_000,
            channels: 1,
            language_code: "en-US".to_string(),
            model: "phone_call".to_string(),
            interim_results: true,
        }
    }
}

impl TranscriptionConfig {
    /// Checks that the described audio source is one the pipeline can read.
    pub fn validate(&self) -> Result<(), String> {
        if !(8_000..=48_000).contains(&self.sample_rate_hz) {
            return Err(format!(
                "unsupported sample rate: {} Hz",
                self.sample_rate_hz
            ));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(format!("unsupported channel count: {}", self.channels));
        }
        if self.language_code.trim().is_empty() {
            return Err("language code must not be empty".to_string());
        }
        Ok(())
    }
}
