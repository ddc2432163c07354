//! 헬스 체크 핸들러

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

/// GET /health. 건강한 세션이 하나도 없으면 503.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.pool.health();
    let status = if health.healthy == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(serde_json::json!({
            "status": health.status(),
            "healthy": health.healthy,
            "total": health.total,
            "tracks": state.catalog.len(),
            "rooms": state.rooms.room_count(),
            "server": "chanstream-rs",
        })),
    )
}
