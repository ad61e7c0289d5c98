use crate::config::DialogueConfig;
use crate::error::VoiceError;
use crate::service::{DialogueEngine, DialogueReply, DialogueRequest};
use async_trait::async_trait;
use std::time::Duration;

/// Dialogue engine reached over HTTP.
///
/// Each utterance is sent as a JSON [`DialogueRequest`] (`POST` to the
/// configured endpoint); the response body must be a JSON object
/// `{"text": "...", "context": {...}}`, where `context` is optional.
#[derive(Debug, Clone)]
pub struct HttpDialogueEngine {
    client: reqwest::Client,
    config: DialogueConfig,
}

impl HttpDialogueEngine {
    pub fn new(config: DialogueConfig) -> Result<Self, VoiceError> {
        if !config.is_enabled() {
            return Err(VoiceError::Config(
                "dialogue endpoint is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DialogueEngine for HttpDialogueEngine {
    async fn generate_reply(&self, request: &DialogueRequest) -> Result<DialogueReply, VoiceError> {
        let mut builder = self.client.post(&self.config.endpoint).json(request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Dialogue(format!(
                "dialogue endpoint returned {}",
                status
            )));
        }

        let reply: DialogueReply = response.json().await?;
        if reply.text.trim().is_empty() {
            return Err(VoiceError::Dialogue("empty reply".to_string()));
        }
        tracing::debug!(
            session_id = %request.session_id,
            reply_len = reply.text.len(),
            "dialogue reply received"
        );
        Ok(reply)
    }
}
