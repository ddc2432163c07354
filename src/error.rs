//! 에러 타입 정의

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// 백엔드 세션(봇 클라이언트) 호출 에러
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("session credentials rejected")]
    Unauthorized,
    #[error("channel {0} is outside the session scope")]
    Forbidden(i64),
    #[error("message {channel_id}:{message_id} not found")]
    NotFound { channel_id: i64, message_id: i64 },
    /// 기록된 크기보다 파일이 짧다. 세션이 아니라 파일의 문제다.
    #[error("file ended early at offset {offset}")]
    Truncated { offset: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 스트리밍 에러
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("track not found")]
    TrackNotFound,
    #[error("range not satisfiable")]
    RangeUnsatisfiable { total: u64 },
    #[error("no healthy session available")]
    NoHealthySession,
    #[error("session fetch failed: {0}")]
    SessionFetchFailed(#[source] BackendError),
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        match self {
            StreamError::TrackNotFound => (StatusCode::NOT_FOUND, "track not found").into_response(),
            StreamError::RangeUnsatisfiable { total } => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                "range not satisfiable",
            )
                .into_response(),
            StreamError::NoHealthySession | StreamError::SessionFetchFailed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, "1")],
                "stream temporarily unavailable",
            )
                .into_response(),
        }
    }
}

/// 방 이벤트 에러
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("stale event: room is at version {current_version}")]
    StaleRoomEvent { current_version: u64 },
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
    #[error("not allowed")]
    NotAllowed,
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("track not found")]
    TrackNotFound,
}

impl RoomError {
    /// 클라이언트에 전달되는 에러 코드
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::StaleRoomEvent { .. } => "stale",
            RoomError::RoomNotFound => "room_not_found",
            RoomError::RoomFull => "room_full",
            RoomError::NotAllowed => "not_allowed",
            RoomError::InvalidEvent(_) => "invalid_event",
            RoomError::TrackNotFound => "track_not_found",
        }
    }
}

/// 수집 에러. 실패한 메시지는 다음 폴링에서 다시 처리된다.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no healthy session can read channel {0}")]
    NoAuthor(i64),
    #[error("no healthy session can copy track {0} to the dump channel")]
    NoCopier(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 카탈로그 저장소 에러
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog io: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog encoding: {0}")]
    Serde(#[from] serde_json::Error),
}
