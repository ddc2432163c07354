//! 카탈로그 조회 핸들러

use crate::backend::ChannelId;
use crate::catalog::{Track, TrackPage, TrackQuery};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 클라이언트에 보이는 트랙. 보유 세션 목록은 내보내지 않는다.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackView {
    pub id: String,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub duration_sec: Option<f64>,
    pub size: u64,
    pub mime_type: String,
    pub created_at: u64,
    pub source_channel_id: ChannelId,
    pub source_message_id: i64,
}

impl From<Track> for TrackView {
    fn from(track: Track) -> Self {
        Self {
            id: track.id,
            title: track.title,
            performer: track.performer,
            duration_sec: track.duration_sec,
            size: track.size,
            mime_type: track.mime_type,
            created_at: track.created_at,
            source_channel_id: track.source.channel_id,
            source_message_id: track.source.message_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackListResponse {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub items: Vec<TrackView>,
}

impl From<TrackPage> for TrackListResponse {
    fn from(page: TrackPage) -> Self {
        Self {
            page: page.page,
            per_page: page.per_page,
            total: page.total,
            items: page.items.into_iter().map(TrackView::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TrackListParams {
    pub q: Option<String>,
    pub channel_id: Option<ChannelId>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

/// GET /tracks
pub async fn list_tracks_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TrackListParams>,
) -> Json<TrackListResponse> {
    let page = state.catalog.search(&TrackQuery {
        text: params.q,
        channel_id: params.channel_id,
        page: params.page,
        per_page: params.per_page,
    });
    Json(page.into())
}

/// GET /tracks/:track_id
pub async fn track_handler(
    State(state): State<Arc<AppState>>,
    Path(track_id): Path<String>,
) -> Response {
    match state.catalog.get(&track_id) {
        Some(track) => Json(TrackView::from(track)).into_response(),
        None => (StatusCode::NOT_FOUND, "track not found").into_response(),
    }
}
