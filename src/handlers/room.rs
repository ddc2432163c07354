//! 방 이벤트 핸들러

use super::connection::handle_ping;
use crate::protocol::{Inbound, ServerMessage};
use crate::room::manager::ConnectionId;
use crate::state::AppState;
use std::ops::ControlFlow;
use tokio::sync::mpsc::UnboundedSender;

/// 텍스트 프레임 하나를 처리한다. 연결을 끝내야 하면 Break.
pub async fn handle_client_message(
    state: &AppState,
    room_id: &str,
    connection_id: ConnectionId,
    participant: &str,
    sender: &UnboundedSender<ServerMessage>,
    text: &str,
) -> ControlFlow<()> {
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::debug!(room_id = %room_id, participant = %participant, error = %e, "Unsupported message");
            let _ = sender.send(ServerMessage::error(&e));
            return ControlFlow::Continue(());
        }
    };

    match inbound {
        Inbound::Ping => handle_ping(sender),
        Inbound::Sync => {
            if let Err(e) = state.rooms.sync(room_id, sender).await {
                let _ = sender.send(ServerMessage::error(&e));
            }
            ControlFlow::Continue(())
        }
        Inbound::Leave => {
            if let Err(e) = state.rooms.leave(room_id, participant).await {
                let _ = sender.send(ServerMessage::error(&e));
            }
            ControlFlow::Break(())
        }
        Inbound::Command { version, command } => {
            let event = command.name();
            // 거부 응답은 방 관리자가 이미 보냈다
            if let Err(e) = state
                .rooms
                .submit(room_id, connection_id, version, command, sender)
                .await
            {
                tracing::debug!(
                    room_id = %room_id,
                    participant = %participant,
                    event = event,
                    code = e.code(),
                    "Room event rejected"
                );
            }
            ControlFlow::Continue(())
        }
    }
}
