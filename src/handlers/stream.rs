//! 스트리밍 핸들러

use crate::dispatcher::StreamResponse;
use crate::error::StreamError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use std::sync::Arc;

/// GET /stream/:track_id
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(track_id): Path<String>,
    headers: HeaderMap,
) -> Result<StreamResponse, StreamError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    state
        .dispatcher
        .serve(&track_id, range)
        .await
        .inspect_err(|e| match e {
            StreamError::TrackNotFound | StreamError::RangeUnsatisfiable { .. } => {
                tracing::debug!(track_id = %track_id, error = %e, "Stream rejected")
            }
            _ => tracing::warn!(track_id = %track_id, error = %e, "Stream unavailable"),
        })
}
