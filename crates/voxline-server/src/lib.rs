//! voxline server: HTTP and WebSocket surface for the voice pipeline.
//!
//! Telephony legs stream audio in over `/media`; observers watch sessions
//! live over `/ws`; operators inspect and stop streams over `/api/streams`.

pub mod api_media;
pub mod api_streams;
pub mod api_ws;
pub mod background;
pub mod broker;
pub mod config;
pub mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use broker::SubscriptionBroker;
use config::Config;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use voxline_memory::ConversationStore;
use voxline_pipeline::{PipelineServices, StreamPipeline};
use voxline_types::{TranscriptionConfig, VoiceOptions};
use voxline_voice::{DialogueEngine, SpeechSynthesizer, TranscriptionService};

#[derive(Clone)]
pub struct AppState {
    pub broker: SubscriptionBroker,
    pub pipeline: StreamPipeline,
    pub memory: Arc<ConversationStore>,
    /// HMAC key for observer tokens.
    pub token_secret: Arc<[u8; 32]>,
    pub token_ttl: Duration,
    /// Audio profile assumed when a media leg does not describe its own.
    pub transcription_defaults: TranscriptionConfig,
    pub voice_defaults: VoiceOptions,
    /// Cancelled on shutdown; open sockets close when it fires.
    pub shutdown: CancellationToken,
}

/// The external services the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub transcription: Arc<dyn TranscriptionService>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub dialogue: Arc<dyn DialogueEngine>,
}

impl AppState {
    /// Wires the broker, conversation store and pipeline together.
    pub fn build(config: &Config, token_secret: [u8; 32], backends: Backends) -> Self {
        let broker = SubscriptionBroker::new();
        let memory = Arc::new(ConversationStore::new(config.memory.settings()));
        let pipeline = StreamPipeline::new(
            config.pipeline.clone(),
            PipelineServices {
                transcription: backends.transcription,
                synthesizer: backends.synthesizer,
                dialogue: backends.dialogue,
                memory: memory.clone(),
                sink: Arc::new(broker.clone()),
            },
        );
        Self {
            broker,
            pipeline,
            memory,
            token_secret: Arc::new(token_secret),
            token_ttl: config.auth.token_ttl(),
            transcription_defaults: config.transcription.stream_defaults(),
            voice_defaults: config.synthesis.voice(),
            shutdown: CancellationToken::new(),
        }
    }
}

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "streams": state.pipeline.stream_ids().len(),
    }))
}

pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/tokens", post(api_ws::create_observer_token_handler))
        .route("/api/streams", get(api_streams::list_streams_handler))
        .route(
            "/api/streams/{streamId}",
            get(api_streams::get_stream_handler),
        )
        .route(
            "/api/streams/{streamId}/stop",
            post(api_streams::stop_stream_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .route("/media", get(api_media::media_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
