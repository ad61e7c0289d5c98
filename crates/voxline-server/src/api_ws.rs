//! Observer WebSocket endpoint.

use crate::middleware::{generate_observer_token, verify_observer_token, PrincipalContext};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use uuid::Uuid;
use voxline_types::{ClientMessage, PrincipalInfo, ServerEvent};

/// Query parameters for the observer connection.
#[derive(Debug, Deserialize)]
pub struct ObserverConnectParams {
    pub token: Option<String>,
}

/// `POST /api/tokens` issues an observer token for the authenticated
/// principal. Clients then connect to `/ws?token=<token>`.
pub async fn create_observer_token_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(PrincipalContext(principal)): Extension<PrincipalContext>,
) -> Json<Value> {
    let token = generate_observer_token(&principal, &state.token_secret, state.token_ttl);
    Json(json!({
        "token": token,
        "expiresInSecs": state.token_ttl.as_secs(),
    }))
}

/// WebSocket handler: `GET /ws?token=...`.
///
/// The token is verified before the upgrade; a missing or invalid token is
/// answered with `401` and no socket is opened.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<ObserverConnectParams>,
) -> impl IntoResponse {
    let Some(token) = params.token.as_deref() else {
        tracing::warn!(remote_addr = %addr, "observer connect missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match verify_observer_token(token, &state.token_secret) {
        Ok(principal) => {
            tracing::info!(
                uid = %principal.uid,
                role = %principal.role,
                remote_addr = %addr,
                "observer auth success"
            );
            ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
        }
        Err(code) => {
            tracing::warn!(remote_addr = %addr, status = %code, "observer token verification failed");
            code.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, principal: PrincipalInfo) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow observer loses events instead of growing memory.
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let client_id = state.broker.connect(principal.clone(), tx).await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let Some(Ok(msg)) = msg else {
            break;
        };
        match msg {
            AxumMessage::Text(text) => handle_client_text(&state, client_id, text.as_str()).await,
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    state.broker.disconnect(client_id).await;
    send_task.abort();
    tracing::debug!(client_id = %client_id, uid = %principal.uid, "observer socket closed");
}

async fn handle_client_text(state: &AppState, client_id: Uuid, text: &str) {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Subscribe { room }) => {
            state.broker.subscribe(client_id, &room).await;
        }
        Ok(ClientMessage::Unsubscribe { room }) => {
            state.broker.unsubscribe(client_id, &room).await;
        }
        Ok(ClientMessage::Update { topic, data }) => {
            let event = ServerEvent::rebroadcast(topic.kind, data);
            let delivered = state.broker.broadcast(&topic.to_string(), &event).await;
            tracing::debug!(client_id = %client_id, topic = %topic, delivered, "rebroadcast update");
        }
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = ?e, "rejected observer message");
            state
                .broker
                .send(client_id, &ServerEvent::error(e.to_string()))
                .await;
        }
    }
}
