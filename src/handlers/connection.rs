//! 방 채널 연결 핸들러

use super::room::handle_client_message;
use crate::protocol::ServerMessage;
use crate::room::manager::ConnectionId;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};

pub const PARTICIPANT_HEADER: &str = "x-participant-id";

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub participant: Option<String>,
}

/// 인증 경계가 넘겨준 참가자 ID (헤더 우선)
pub fn participant_identity(headers: &HeaderMap, params: &ConnectParams) -> Option<String> {
    headers
        .get(PARTICIPANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.participant.clone())
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

/// GET /rooms/:room_id/ws
pub async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let Some(participant) = participant_identity(&headers, &params) else {
        return (StatusCode::UNAUTHORIZED, "participant identity required").into_response();
    };
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response();
    };
    let room_id = room_id.trim().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, participant))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, room_id: String, participant: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // 송신 태스크
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode room message"),
            }
        }
        let _ = ws_sender.close().await;
    });

    // 연결 처리
    let Some(connection_id) = handle_connection(&state, &room_id, &participant, tx.clone()).await else {
        // 에러 메시지를 보낸 뒤 닫는다
        drop(tx);
        let _ = send_task.await;
        return;
    };

    // 수신 처리
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let flow =
                    handle_client_message(&state, &room_id, connection_id, &participant, &tx, &text).await;
                if flow.is_break() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(room_id = %room_id, participant = %participant, error = %e, "Socket error");
                break;
            }
            _ => {}
        }
    }

    // 연결 해제
    handle_disconnect(&state, &room_id, connection_id).await;
    send_task.abort();
}

/// 새 연결 처리. 실패하면 에러 메시지를 보내고 None.
pub async fn handle_connection(
    state: &AppState,
    room_id: &str,
    participant: &str,
    sender: UnboundedSender<ServerMessage>,
) -> Option<ConnectionId> {
    match state.rooms.connect(room_id, participant, sender.clone()).await {
        Ok(connection_id) => {
            tracing::info!(
                room_id = %room_id,
                participant = %participant,
                connection_id = %connection_id,
                "New connection established"
            );
            Some(connection_id)
        }
        Err(e) => {
            let _ = sender.send(ServerMessage::error(&e));
            None
        }
    }
}

/// 연결 해제 처리
pub async fn handle_disconnect(state: &AppState, room_id: &str, connection_id: ConnectionId) {
    state.rooms.disconnect(room_id, connection_id).await;
    tracing::info!(room_id = %room_id, connection_id = %connection_id, "Connection closed");
}

/// ping 처리
pub fn handle_ping(sender: &UnboundedSender<ServerMessage>) -> ControlFlow<()> {
    let _ = sender.send(ServerMessage::Pong {
        server_time_ms: crate::room::manager::now_millis(),
    });
    ControlFlow::Continue(())
}
