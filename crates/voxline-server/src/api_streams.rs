//! Stream status and control routes.

use crate::middleware::PrincipalContext;
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use voxline_pipeline::StreamStatus;
use voxline_types::StreamSummary;

/// `GET /api/streams` returns the status of every running stream, ordered by id.
pub async fn list_streams_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<StreamStatus>> {
    let mut ids = state.pipeline.stream_ids();
    ids.sort();
    Json(
        ids.iter()
            .filter_map(|id| state.pipeline.status(id))
            .collect(),
    )
}

/// `GET /api/streams/{streamId}`
pub async fn get_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamStatus>, StatusCode> {
    state
        .pipeline
        .status(&stream_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// `POST /api/streams/{streamId}/stop` stops the stream and returns its
/// summary once teardown has finished.
pub async fn stop_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(PrincipalContext(principal)): Extension<PrincipalContext>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamSummary>, StatusCode> {
    let summary = state
        .pipeline
        .stop_stream(&stream_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    tracing::info!(
        stream_id = %stream_id,
        uid = %principal.uid,
        turns = summary.turn_count,
        "stream stopped via api"
    );
    Ok(Json(summary))
}
