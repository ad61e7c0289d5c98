#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use voxline_pipeline::PipelineSettings;
use voxline_server::config::Config;
use voxline_server::middleware::{derive_token_secret, generate_observer_token};
use voxline_server::{app, AppState, Backends};
use voxline_types::{PrincipalInfo, TranscriptionConfig, VoiceOptions};
use voxline_voice::{
    AudioFrame, DialogueEngine, DialogueReply, DialogueRequest, SpeechSynthesizer,
    TranscriptResult, TranscriptionError, TranscriptionService, TranscriptionStream, VoiceError,
};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TEST_SECRET: &str = "test-secret";

/// Treats inbound audio as UTF-8 text and emits one final transcript per
/// newline-terminated line.
pub struct LineTranscriber;

#[async_trait]
impl TranscriptionService for LineTranscriber {
    async fn open_stream(
        &self,
        _config: &TranscriptionConfig,
    ) -> Result<TranscriptionStream, TranscriptionError> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(64);
        let (results_tx, results_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut pending = Vec::new();
            while let Some(frame) = audio_rx.recv().await {
                let AudioFrame::Audio(bytes) = frame else {
                    continue;
                };
                pending.extend_from_slice(&bytes);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                    if results_tx
                        .send(Ok(TranscriptResult::final_result(text, 0.9)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
        Ok(TranscriptionStream {
            audio: audio_tx,
            results: results_rx,
        })
    }
}

/// Answers "hello" with "hi there" and echoes everything else.
pub struct GreetingDialogue;

#[async_trait]
impl DialogueEngine for GreetingDialogue {
    async fn generate_reply(&self, request: &DialogueRequest) -> Result<DialogueReply, VoiceError> {
        let text = match request.utterance.as_str() {
            "hello" => "hi there".to_string(),
            other => format!("echo: {}", other),
        };
        Ok(DialogueReply {
            text,
            context: Default::default(),
        })
    }
}

/// "Synthesizes" the reply text as its UTF-8 bytes.
pub struct TextSynthesizer;

#[async_trait]
impl SpeechSynthesizer for TextSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        Ok(text.as_bytes().to_vec())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.token_secret = TEST_SECRET.to_string();
    config.pipeline = PipelineSettings {
        flush_threshold_bytes: 1,
        ..PipelineSettings::default()
    };
    config
}

pub fn test_state() -> AppState {
    AppState::build(
        &test_config(),
        derive_token_secret(TEST_SECRET),
        Backends {
            transcription: Arc::new(LineTranscriber),
            synthesizer: Arc::new(TextSynthesizer),
            dialogue: Arc::new(GreetingDialogue),
        },
    )
}

pub fn token_for(state: &AppState, uid: &str) -> String {
    generate_observer_token(
        &PrincipalInfo {
            uid: uid.to_string(),
            role: "observer".to_string(),
        },
        &state.token_secret,
        Duration::from_secs(60),
    )
}

/// Serves the app on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Connects an observer and consumes its `connection_established` frame.
pub async fn connect_observer(addr: SocketAddr, token: &str) -> (WsStream, Value) {
    let url = format!("ws://{}/ws?token={}", addr, token);
    let (mut ws, _) = connect_async(url).await.expect("failed to connect");
    let greeting = next_json(&mut ws).await;
    assert_eq!(greeting["type"], "connection_established");
    (ws, greeting)
}

pub async fn connect_media(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{}/media", addr);
    let (ws, _) = connect_async(url).await.expect("failed to connect");
    ws
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send");
}

pub async fn send_raw(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("failed to send");
}

/// Next text frame parsed as JSON.
pub async fn next_json(ws: &mut WsStream) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("frame is JSON")
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Asserts no text frame arrives within a short window.
pub async fn assert_silent(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("unexpected frame: {}", text);
    }
}

pub async fn subscribe(ws: &mut WsStream, room: &str) {
    send_json(ws, serde_json::json!({"type": "subscribe", "data": {"room": room}})).await;
    let ack = next_json(ws).await;
    assert_eq!(ack["type"], "subscription_confirmed");
    assert_eq!(ack["data"]["room"], room);
}

/// Polls until `check` holds, for state that changes asynchronously.
pub async fn eventually<F>(check: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
