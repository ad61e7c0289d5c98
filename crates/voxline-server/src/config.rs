//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use voxline_memory::MemorySettings;
use voxline_pipeline::PipelineSettings;
use voxline_types::{AudioEncoding, TranscriptionConfig, VoiceOptions};
use voxline_voice::{DialogueConfig, SttConfig, TtsConfig};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observer and API token settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Stream pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Conversation store settings.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Transcription backend and per-stream defaults.
    #[serde(default)]
    pub transcription: TranscriptionSection,

    /// Synthesis backend and default voice.
    #[serde(default)]
    pub synthesis: SynthesisSection,

    /// Dialogue engine endpoint.
    #[serde(default)]
    pub dialogue: DialogueConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxline_pipeline=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Token signing configuration.
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret the HMAC token key is derived from. When empty a random
    /// secret is generated at startup and tokens do not survive restarts.
    #[serde(default)]
    pub token_secret: String,

    /// Lifetime of issued tokens.
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .finish()
    }
}

/// Conversation store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Maximum turns kept per conversation.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Idle time after which an orphaned conversation is reaped.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// How often the reaper runs. `0` disables it.
    #[serde(default = "default_reap_interval_seconds")]
    pub reap_interval_seconds: u64,
}

/// `[transcription]`: the subprocess backend plus the audio profile assumed
/// for streams that do not describe their own.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSection {
    #[serde(flatten)]
    pub backend: SttConfig,

    #[serde(default = "default_language_code")]
    pub language_code: String,

    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,

    /// Recognition model hint passed to the backend.
    #[serde(default = "default_recognition_model")]
    pub model: String,

    #[serde(default = "default_interim_results")]
    pub interim_results: bool,
}

/// `[synthesis]`: the subprocess backend plus the default voice.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisSection {
    #[serde(flatten)]
    pub backend: TtsConfig,

    #[serde(default = "default_language_code")]
    pub language_code: String,

    #[serde(default = "default_voice_name")]
    pub voice_name: String,

    #[serde(default = "default_speaking_rate")]
    pub speaking_rate: f32,

    #[serde(default)]
    pub pitch: f32,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_token_ttl_seconds() -> u64 {
    3600
}

fn default_max_history() -> usize {
    50
}

fn default_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_reap_interval_seconds() -> u64 {
    3600
}

fn default_language_code() -> String {
    "en-US".to_string()
}

fn default_sample_rate_hz() -> u32 {
    16_000
}

fn default_recognition_model() -> String {
    "phone_call".to_string()
}

fn default_interim_results() -> bool {
    true
}

fn default_voice_name() -> String {
    "en-US-Neural2-F".to_string()
}

fn default_speaking_rate() -> f32 {
    1.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            token_ttl_seconds: default_token_ttl_seconds(),
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            ttl_seconds: default_ttl_seconds(),
            reap_interval_seconds: default_reap_interval_seconds(),
        }
    }
}

impl MemoryConfig {
    pub fn settings(&self) -> MemorySettings {
        MemorySettings {
            max_history: self.max_history,
            ttl: Duration::from_secs(self.ttl_seconds),
        }
    }
}

impl Default for TranscriptionSection {
    fn default() -> Self {
        Self {
            backend: SttConfig::default(),
            language_code: default_language_code(),
            sample_rate_hz: default_sample_rate_hz(),
            model: default_recognition_model(),
            interim_results: default_interim_results(),
        }
    }
}

impl TranscriptionSection {
    /// Audio profile for streams that do not describe their own.
    pub fn stream_defaults(&self) -> TranscriptionConfig {
        TranscriptionConfig {
            encoding: AudioEncoding::Linear16,
            sample_rate_hz: self.sample_rate_hz,
            channels: 1,
            language_code: self.language_code.clone(),
            model: self.model.clone(),
            interim_results: self.interim_results,
        }
    }
}

impl Default for SynthesisSection {
    fn default() -> Self {
        Self {
            backend: TtsConfig::default(),
            language_code: default_language_code(),
            voice_name: default_voice_name(),
            speaking_rate: default_speaking_rate(),
            pitch: 0.0,
        }
    }
}

impl SynthesisSection {
    pub fn voice(&self) -> VoiceOptions {
        VoiceOptions {
            language_code: self.language_code.clone(),
            voice_name: self.voice_name.clone(),
            speaking_rate: self.speaking_rate,
            pitch: self.pitch,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXLINE_HOST` overrides `server.host`
/// - `VOXLINE_PORT` overrides `server.port`
/// - `VOXLINE_LOG_LEVEL` overrides `logging.level`
/// - `VOXLINE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VOXLINE_TOKEN_SECRET` overrides `auth.token_secret`
/// - `VOXLINE_DIALOGUE_ENDPOINT` overrides `dialogue.endpoint`
/// - `VOXLINE_DIALOGUE_API_KEY` overrides `dialogue.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("VOXLINE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("VOXLINE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("VOXLINE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("VOXLINE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(secret) = std::env::var("VOXLINE_TOKEN_SECRET") {
        config.auth.token_secret = secret;
    }
    if let Ok(endpoint) = std::env::var("VOXLINE_DIALOGUE_ENDPOINT") {
        config.dialogue.endpoint = endpoint;
    }
    if let Ok(api_key) = std::env::var("VOXLINE_DIALOGUE_API_KEY") {
        config.dialogue.api_key = api_key;
    }

    Ok(config)
}
