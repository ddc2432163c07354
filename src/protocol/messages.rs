//! 방 채널 메시지 프로토콜 정의

use crate::catalog::TrackId;
use crate::error::RoomError;
use crate::room::{ParticipantId, RoomCommand, RoomSnapshot, SettingsPatch, SkipDirection};
use serde::{Deserialize, Serialize};

/// 클라이언트 → 서버 메시지
///
/// `{"type": "...", "version": n, "payload": {...}}` 형태. 변경 이벤트는 `version`이
/// 필수이고 ping/sync/leave는 무시한다.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    // Connection
    Ping,
    Sync,
    Leave,

    // Playback
    Play,
    Pause,
    Seek {
        position_sec: f64,
    },
    Skip {
        direction: SkipDirection,
    },

    // Queue
    QueueAdd {
        track_id: TrackId,
        position: Option<usize>,
    },
    QueueRemove {
        track_id: TrackId,
    },
    QueueReorder {
        queue: Vec<TrackId>,
    },

    // Host
    Settings(SettingsPatch),
    DesignateSuccessor {
        participant_id: Option<ParticipantId>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    version: Option<u64>,
}

/// 파싱된 인바운드 메시지
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Sync,
    Leave,
    Command { version: u64, command: RoomCommand },
}

impl Inbound {
    /// 텍스트 프레임 하나를 해석한다
    pub fn parse(text: &str) -> Result<Self, RoomError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| RoomError::InvalidEvent(format!("malformed message: {}", e)))?;
        let envelope: Envelope = serde_json::from_value(value.clone()).unwrap_or_default();
        let message: ClientMessage = serde_json::from_value(value)
            .map_err(|e| RoomError::InvalidEvent(format!("unsupported message: {}", e)))?;

        let command = match message {
            ClientMessage::Ping => return Ok(Inbound::Ping),
            ClientMessage::Sync => return Ok(Inbound::Sync),
            ClientMessage::Leave => return Ok(Inbound::Leave),
            ClientMessage::Play => RoomCommand::Play,
            ClientMessage::Pause => RoomCommand::Pause,
            ClientMessage::Seek { position_sec } => RoomCommand::Seek { position_sec },
            ClientMessage::Skip { direction } => RoomCommand::Skip { direction },
            ClientMessage::QueueAdd { track_id, position } => {
                RoomCommand::QueueAdd { track_id, position }
            }
            ClientMessage::QueueRemove { track_id } => RoomCommand::QueueRemove { track_id },
            ClientMessage::QueueReorder { queue } => RoomCommand::QueueReorder { queue },
            ClientMessage::Settings(patch) => RoomCommand::UpdateSettings(patch),
            ClientMessage::DesignateSuccessor { participant_id } => {
                RoomCommand::DesignateSuccessor { participant_id }
            }
        };

        let version = envelope
            .version
            .ok_or_else(|| RoomError::InvalidEvent(format!("{} requires a version", command.name())))?;
        Ok(Inbound::Command { version, command })
    }
}

/// 서버 → 클라이언트 메시지
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// 방 전체 상태. 변경이 적용될 때마다 모든 연결에 전송된다.
    Snapshot(RoomSnapshot),
    /// 버전 불일치로 거부된 이벤트에 대한 응답
    Stale {
        #[serde(rename = "currentVersion")]
        current_version: u64,
        snapshot: RoomSnapshot,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {
        #[serde(rename = "serverTimeMs")]
        server_time_ms: u64,
    },
}

impl ServerMessage {
    pub fn error(err: &RoomError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
