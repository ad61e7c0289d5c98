//! Telephony media-stream endpoint.
//!
//! One socket carries one call leg: `connected`, then `start` with the
//! stream metadata, any number of `media` frames with base64 audio, and
//! finally `stop`. Reply audio produced by the pipeline is written back on
//! the same socket as `media` frames.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use voxline_memory::ContextSeed;
use voxline_pipeline::{EndReason, PipelineError, StreamOptions};
use voxline_types::{AudioEncoding, TranscriptionConfig};

/// Reply audio chunks buffered per call before new ones are dropped.
const REPLY_AUDIO_QUEUE: usize = 32;

/// An inbound media-stream frame, tagged by `event`.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaFrame {
    Connected,
    Start { start: StartMetadata },
    Media { media: MediaPayload },
    Stop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub custom_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMedia<'a> {
    event: &'static str,
    stream_sid: &'a str,
    media: OutboundPayload,
}

#[derive(Debug, Serialize)]
struct OutboundPayload {
    payload: String,
}

impl StartMetadata {
    /// `customParameters.sessionId`, else the call id, else the stream id.
    pub fn session_id(&self) -> String {
        self.custom_parameters
            .get("sessionId")
            .filter(|id| !id.is_empty())
            .or(self.call_sid.as_ref().filter(|id| !id.is_empty()))
            .unwrap_or(&self.stream_sid)
            .clone()
    }

    /// Conversation seed from the custom parameters: `persona` becomes the
    /// persona, everything except `persona` and `sessionId` becomes metadata.
    pub fn context_seed(&self) -> ContextSeed {
        let mut metadata = self.custom_parameters.clone();
        metadata.remove("sessionId");
        let persona = metadata.remove("persona").unwrap_or_default();
        ContextSeed { persona, metadata }
    }

    /// The transcription profile for this leg, starting from `defaults`.
    pub fn transcription(&self, defaults: &TranscriptionConfig) -> TranscriptionConfig {
        let mut config = defaults.clone();
        if let Some(format) = &self.media_format {
            match format.encoding.as_str() {
                "audio/x-mulaw" | "mulaw" => config.encoding = AudioEncoding::Mulaw,
                "audio/l16" | "linear16" => config.encoding = AudioEncoding::Linear16,
                "" => {}
                other => tracing::warn!(encoding = other, "unknown media encoding, using default"),
            }
            if let Some(rate) = format.sample_rate {
                config.sample_rate_hz = rate;
            }
            if let Some(channels) = format.channels {
                config.channels = channels;
            }
        }
        if let Some(language) = self.custom_parameters.get("languageCode") {
            config.language_code = language.clone();
        }
        config
    }
}

/// WebSocket handler: `GET /media`.
pub async fn media_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::debug!(remote_addr = %addr, "media stream connecting");
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

struct ActiveCall {
    stream_id: String,
    reply_task: JoinHandle<()>,
}

async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut call: Option<ActiveCall> = None;

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let Some(Ok(msg)) = msg else {
            break;
        };
        let text = match msg {
            AxumMessage::Text(text) => text,
            AxumMessage::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<MediaFrame>(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("ignoring unparseable media frame: {}", e);
                continue;
            }
        };

        match frame {
            MediaFrame::Connected => tracing::debug!("media stream connected"),
            MediaFrame::Start { start } => {
                if let Some(active) = &call {
                    tracing::warn!(
                        stream_id = %active.stream_id,
                        "ignoring second start on the same media socket"
                    );
                    continue;
                }
                match start_call(&state, &start, out_tx.clone()).await {
                    Ok(active) => call = Some(active),
                    Err(e) => {
                        tracing::warn!(stream_id = %start.stream_sid, error = %e, "stream start rejected");
                        break;
                    }
                }
            }
            MediaFrame::Media { media } => {
                let Some(active) = &call else {
                    tracing::debug!("media frame before start, dropping");
                    continue;
                };
                let chunk = match base64::engine::general_purpose::STANDARD.decode(&media.payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(stream_id = %active.stream_id, "ignoring media frame with bad payload: {}", e);
                        continue;
                    }
                };
                if let Err(e) = state.pipeline.feed_audio(&active.stream_id, chunk).await {
                    match e {
                        PipelineError::NotFound(_) => {
                            tracing::info!(stream_id = %active.stream_id, "stream ended, closing media socket")
                        }
                        other => {
                            tracing::warn!(stream_id = %active.stream_id, error = %other, "audio rejected, closing media socket")
                        }
                    }
                    break;
                }
            }
            MediaFrame::Stop => {
                if let Some(active) = call.take() {
                    state.pipeline.stop_stream(&active.stream_id).await;
                    active.reply_task.abort();
                }
                break;
            }
            MediaFrame::Other => {}
        }
    }

    if let Some(active) = call.take() {
        state
            .pipeline
            .stop_stream_with(&active.stream_id, EndReason::TransportClosed)
            .await;
        active.reply_task.abort();
    }
    send_task.abort();
}

async fn start_call(
    state: &AppState,
    start: &StartMetadata,
    out_tx: mpsc::Sender<String>,
) -> Result<ActiveCall, PipelineError> {
    let session_id = start.session_id();
    let (audio_tx, audio_rx) = mpsc::channel(REPLY_AUDIO_QUEUE);
    let options = StreamOptions {
        transcription: start.transcription(&state.transcription_defaults),
        voice: state.voice_defaults.clone(),
        context: start.context_seed(),
        audio_out: Some(audio_tx),
    };

    state
        .pipeline
        .start_stream(&start.stream_sid, &session_id, options)
        .await?;

    tracing::info!(stream_id = %start.stream_sid, session_id = %session_id, "media stream started");
    let reply_task = tokio::spawn(forward_reply_audio(
        start.stream_sid.clone(),
        audio_rx,
        out_tx,
    ));
    Ok(ActiveCall {
        stream_id: start.stream_sid.clone(),
        reply_task,
    })
}

async fn forward_reply_audio(
    stream_sid: String,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<String>,
) {
    while let Some(audio) = audio_rx.recv().await {
        let frame = OutboundMedia {
            event: "media",
            stream_sid: &stream_sid,
            media: OutboundPayload {
                payload: base64::engine::general_purpose::STANDARD.encode(&audio),
            },
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize reply media frame: {}", e);
                continue;
            }
        };
        if let Err(e) = out_tx.try_send(json) {
            tracing::warn!(stream_id = %stream_sid, "dropping reply audio: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_telephony_frames() {
        let frame: MediaFrame =
            serde_json::from_str(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
                .unwrap();
        assert!(matches!(frame, MediaFrame::Connected));

        let frame: MediaFrame = serde_json::from_str(
            r#"{"event":"media","sequenceNumber":"3","media":{"track":"inbound","payload":"AAEC"}}"#,
        )
        .unwrap();
        match frame {
            MediaFrame::Media { media } => assert_eq!(media.payload, "AAEC"),
            other => panic!("unexpected frame: {:?}", other),
        }

        let frame: MediaFrame = serde_json::from_str(r#"{"event":"mark","mark":{}}"#).unwrap();
        assert!(matches!(frame, MediaFrame::Other));
    }

    #[test]
    fn start_metadata_picks_session_and_context() {
        let frame: MediaFrame = serde_json::from_str(
            r#"{
                "event": "start",
                "start": {
                    "streamSid": "MZ1",
                    "callSid": "CA1",
                    "customParameters": {
                        "sessionId": "interview-7",
                        "persona": "technical recruiter",
                        "company": "Acme"
                    },
                    "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
                }
            }"#,
        )
        .unwrap();
        let MediaFrame::Start { start } = frame else {
            panic!("expected start frame");
        };
        assert_eq!(start.session_id(), "interview-7");

        let seed = start.context_seed();
        assert_eq!(seed.persona, "technical recruiter");
        assert_eq!(seed.metadata.get("company").map(String::as_str), Some("Acme"));
        assert!(!seed.metadata.contains_key("sessionId"));

        let config = start.transcription(&TranscriptionConfig::default());
        assert_eq!(config.encoding, AudioEncoding::Mulaw);
        assert_eq!(config.sample_rate_hz, 8000);
    }

    #[test]
    fn session_id_falls_back_to_call_then_stream() {
        let mut start = StartMetadata {
            stream_sid: "MZ1".to_string(),
            call_sid: Some("CA1".to_string()),
            custom_parameters: BTreeMap::new(),
            media_format: None,
        };
        assert_eq!(start.session_id(), "CA1");
        start.call_sid = None;
        assert_eq!(start.session_id(), "MZ1");
    }
}
