//! 방 관리자
//!
//! 방마다 하나의 잠금 구간에서 버전 검사, 적용, 브로드캐스트가 이루어진다.
//! 따라서 같은 방의 모든 연결은 스냅샷을 같은 순서로 받는다.

use super::{ParticipantId, Room, RoomCommand, RoomId, RoomSnapshot};
use crate::catalog::TrackLocator;
use crate::error::RoomError;
use crate::pool::MIN_TASK_INTERVAL;
use crate::protocol::ServerMessage;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ConnectionId = Uuid;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

struct Connection {
    participant: ParticipantId,
    sender: UnboundedSender<ServerMessage>,
}

struct RoomEntry {
    room: Room,
    connections: HashMap<ConnectionId, Connection>,
    empty_since: Option<Instant>,
    /// 정리된 방. 이 플래그를 본 참가자는 새 방을 만든다.
    closed: bool,
}

impl RoomEntry {
    fn new(room_id: &str) -> Self {
        Self {
            room: Room::new(room_id),
            connections: HashMap::new(),
            empty_since: None,
            closed: false,
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        for connection in self.connections.values() {
            let _ = connection.sender.send(message.clone());
        }
    }

    fn broadcast_snapshot(&self) {
        self.broadcast(ServerMessage::Snapshot(self.room.snapshot(now_millis())));
    }

    fn has_connection_for(&self, participant: &str) -> bool {
        self.connections
            .values()
            .any(|c| c.participant == participant)
    }

    fn mark_empty_if_needed(&mut self, room_id: &str) {
        if self.room.is_empty() && self.connections.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
            tracing::info!(room_id = %room_id, "Room is empty, grace period started");
        }
    }
}

/// 활성 방 레지스트리
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Mutex<RoomEntry>>>,
    catalog: Arc<TrackLocator>,
    max_size: usize,
    grace: Duration,
}

impl RoomManager {
    pub fn new(catalog: Arc<TrackLocator>, max_size: usize, grace: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            catalog,
            max_size,
            grace,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn entry(&self, room_id: &str) -> Option<Arc<Mutex<RoomEntry>>> {
        self.rooms.get(room_id).map(|e| e.clone())
    }

    /// 연결 등록. 방이 없으면 만들고, 로스터에 없으면 참가시킨다.
    pub async fn connect(
        &self,
        room_id: &str,
        participant: &str,
        sender: UnboundedSender<ServerMessage>,
    ) -> Result<ConnectionId, RoomError> {
        loop {
            let entry = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| {
                    tracing::info!(room_id = %room_id, "Room created");
                    Arc::new(Mutex::new(RoomEntry::new(room_id)))
                })
                .clone();

            let mut guard = entry.lock().await;
            if guard.closed {
                // 정리 직후의 항목을 잡은 경우 새 방으로 다시 시도
                continue;
            }

            if !guard.room.contains(participant) && guard.room.roster().len() >= self.max_size {
                tracing::warn!(room_id = %room_id, participant = %participant, "Room full, rejected join");
                return Err(RoomError::RoomFull);
            }

            let joined = guard.room.join(participant, now_millis());
            let connection_id = Uuid::new_v4();
            guard.connections.insert(
                connection_id,
                Connection {
                    participant: participant.to_string(),
                    sender: sender.clone(),
                },
            );
            guard.empty_since = None;

            if joined {
                tracing::info!(
                    room_id = %room_id,
                    participant = %participant,
                    members = guard.room.roster().len(),
                    "Participant joined room"
                );
                guard.broadcast_snapshot();
            } else {
                let _ = sender.send(ServerMessage::Snapshot(guard.room.snapshot(now_millis())));
            }
            return Ok(connection_id);
        }
    }

    /// 연결 해제. 참가자의 마지막 연결이면 로스터에서도 뺀다.
    pub async fn disconnect(&self, room_id: &str, connection_id: ConnectionId) {
        let Some(entry) = self.entry(room_id) else {
            return;
        };
        let mut guard = entry.lock().await;
        let Some(connection) = guard.connections.remove(&connection_id) else {
            return;
        };

        if !guard.has_connection_for(&connection.participant)
            && guard.room.leave(&connection.participant)
        {
            tracing::info!(
                room_id = %room_id,
                participant = %connection.participant,
                remaining = guard.room.roster().len(),
                "Participant left room"
            );
            guard.broadcast_snapshot();
        }
        guard.mark_empty_if_needed(room_id);
    }

    /// 명시적 퇴장. 참가자의 모든 연결을 방에서 뗀다.
    pub async fn leave(&self, room_id: &str, participant: &str) -> Result<(), RoomError> {
        let entry = self.entry(room_id).ok_or(RoomError::RoomNotFound)?;
        let mut guard = entry.lock().await;
        if guard.closed {
            return Err(RoomError::RoomNotFound);
        }
        guard.connections.retain(|_, c| c.participant != participant);
        if guard.room.leave(participant) {
            tracing::info!(room_id = %room_id, participant = %participant, "Participant left room");
            guard.broadcast_snapshot();
        }
        guard.mark_empty_if_needed(room_id);
        Ok(())
    }

    /// 제어 이벤트 제출
    ///
    /// 수락되면 모든 연결에 새 스냅샷을 보낸다. 거부되면 `reply`로 stale 또는 error
    /// 메시지를 보내고 같은 에러를 돌려준다.
    pub async fn submit(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        version: u64,
        command: RoomCommand,
        reply: &UnboundedSender<ServerMessage>,
    ) -> Result<u64, RoomError> {
        let result = self
            .submit_inner(room_id, connection_id, version, command, reply)
            .await;
        if let Err(err) = &result {
            if !matches!(err, RoomError::StaleRoomEvent { .. }) {
                let _ = reply.send(ServerMessage::error(err));
            }
        }
        result
    }

    async fn submit_inner(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        version: u64,
        command: RoomCommand,
        reply: &UnboundedSender<ServerMessage>,
    ) -> Result<u64, RoomError> {
        let entry = self.entry(room_id).ok_or(RoomError::RoomNotFound)?;
        let mut guard = entry.lock().await;
        if guard.closed {
            return Err(RoomError::RoomNotFound);
        }
        let actor = guard
            .connections
            .get(&connection_id)
            .map(|c| c.participant.clone())
            .ok_or(RoomError::NotAllowed)?;

        if let RoomCommand::QueueAdd { track_id, .. } = &command {
            if !self.catalog.contains(track_id) {
                return Err(RoomError::TrackNotFound);
            }
        }

        let name = command.name();
        let now = now_millis();
        match guard.room.apply(&actor, version, command, now) {
            Ok(new_version) => {
                tracing::debug!(
                    room_id = %room_id,
                    participant = %actor,
                    event = name,
                    version = new_version,
                    "Room event applied"
                );
                guard.broadcast_snapshot();
                Ok(new_version)
            }
            Err(RoomError::StaleRoomEvent { current_version }) => {
                tracing::debug!(
                    room_id = %room_id,
                    participant = %actor,
                    event = name,
                    sent = version,
                    current = current_version,
                    "Stale room event rejected"
                );
                let _ = reply.send(ServerMessage::Stale {
                    current_version,
                    snapshot: guard.room.snapshot(now),
                });
                Err(RoomError::StaleRoomEvent { current_version })
            }
            Err(err) => Err(err),
        }
    }

    /// 현재 스냅샷을 요청한 연결에만 보낸다
    pub async fn sync(
        &self,
        room_id: &str,
        reply: &UnboundedSender<ServerMessage>,
    ) -> Result<(), RoomError> {
        let snapshot = self.snapshot(room_id).await.ok_or(RoomError::RoomNotFound)?;
        let _ = reply.send(ServerMessage::Snapshot(snapshot));
        Ok(())
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let entry = self.entry(room_id)?;
        let guard = entry.lock().await;
        if guard.closed {
            return None;
        }
        Some(guard.room.snapshot(now_millis()))
    }

    /// 유예 시간이 지난 빈 방을 정리한다
    pub fn reap_empty_rooms(&self, now: Instant) -> usize {
        let grace = self.grace;
        let mut reaped = 0;
        self.rooms.retain(|room_id, entry| {
            // 잠겨 있는 방은 사용 중이다
            let Ok(mut guard) = entry.try_lock() else {
                return true;
            };
            let expired = guard
                .empty_since
                .map(|since| now.saturating_duration_since(since) >= grace)
                .unwrap_or(false);
            if expired && guard.room.is_empty() && guard.connections.is_empty() {
                guard.closed = true;
                tracing::info!(room_id = %room_id, "Empty room reaped");
                reaped += 1;
                false
            } else {
                true
            }
        });
        if reaped > 0 {
            tracing::info!(reaped_rooms = reaped, "Room cleanup completed");
        }
        reaped
    }
}

/// 빈 방 정리 태스크
pub fn spawn_reaper(
    manager: Arc<RoomManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_TASK_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Room reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    manager.reap_empty_rooms(Instant::now());
                }
            }
        }
    })
}
