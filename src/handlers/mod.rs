//! 핸들러 모듈

pub mod connection;
pub mod health;
pub mod room;
pub mod stream;
pub mod tracks;

pub use connection::*;
pub use health::*;
pub use stream::*;
pub use tracks::*;

use crate::state::AppState;
use axum::{http::HeaderValue, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// CORS 설정. `*`가 있으면 모든 출처 허용.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    base.allow_origin(allowed)
}

/// 라우터 설정
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(health_handler))
        .route("/tracks", get(list_tracks_handler))
        .route("/tracks/:track_id", get(track_handler))
        .route("/stream/:track_id", get(stream_handler))
        .route("/rooms/:room_id/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing;
