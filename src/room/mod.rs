//! 청취방 동기화 상태 머신
//!
//! 모든 제어 이벤트는 참가자가 마지막으로 본 방 버전을 달고 온다. 현재 버전과 같을
//! 때만 적용되고, 적용될 때마다 버전이 1 증가한다. 재생 위치는 저장하지 않고
//! `offset + (now - anchor)`로 계산한다.

pub mod manager;

use crate::catalog::TrackId;
use crate::error::RoomError;
use serde::{Deserialize, Serialize};

pub use manager::{spawn_reaper, RoomManager};

pub type RoomId = String;
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub joined_at: u64,
    #[serde(skip)]
    join_seq: u64,
}

/// 저장된 재생 커서
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub track_id: TrackId,
    pub offset_sec: f64,
    pub playing: bool,
    pub anchor_ms: u64,
}

impl Cursor {
    fn at(track_id: TrackId, offset_sec: f64, playing: bool, now_ms: u64) -> Self {
        Self {
            track_id,
            offset_sec,
            playing,
            anchor_ms: now_ms,
        }
    }

    /// 현재 재생 위치 (초)
    pub fn position_at(&self, now_ms: u64) -> f64 {
        if !self.playing {
            return self.offset_sec;
        }
        let elapsed = now_ms.saturating_sub(self.anchor_ms) as f64 / 1000.0;
        self.offset_sec + elapsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub allow_playback: bool,
    pub allow_seek: bool,
    pub allow_queue_edit: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_playback: true,
            allow_seek: true,
            allow_queue_edit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub allow_playback: Option<bool>,
    pub allow_seek: Option<bool>,
    pub allow_queue_edit: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipDirection {
    Next,
    Previous,
}

/// 버전 검사를 받는 방 변경 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum RoomCommand {
    Play,
    Pause,
    Seek { position_sec: f64 },
    Skip { direction: SkipDirection },
    QueueAdd { track_id: TrackId, position: Option<usize> },
    QueueRemove { track_id: TrackId },
    QueueReorder { queue: Vec<TrackId> },
    UpdateSettings(SettingsPatch),
    DesignateSuccessor { participant_id: Option<ParticipantId> },
}

impl RoomCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RoomCommand::Play => "play",
            RoomCommand::Pause => "pause",
            RoomCommand::Seek { .. } => "seek",
            RoomCommand::Skip { .. } => "skip",
            RoomCommand::QueueAdd { .. } => "queueAdd",
            RoomCommand::QueueRemove { .. } => "queueRemove",
            RoomCommand::QueueReorder { .. } => "queueReorder",
            RoomCommand::UpdateSettings(_) => "settings",
            RoomCommand::DesignateSuccessor { .. } => "designateSuccessor",
        }
    }
}

/// 클라이언트에 보내는 커서
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorView {
    pub track_id: TrackId,
    pub position_sec: f64,
    pub offset_sec: f64,
    pub anchor_ms: u64,
    pub playing: bool,
}

/// 방 전체 상태. 클라이언트는 항상 통째로 교체한다.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub version: u64,
    pub cursor: Option<CursorView>,
    pub queue: Vec<TrackId>,
    pub roster: Vec<Participant>,
    pub settings: RoomSettings,
    pub successor: Option<ParticipantId>,
    pub server_time_ms: u64,
}

/// 방 하나의 상태
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    version: u64,
    roster: Vec<Participant>,
    queue: Vec<TrackId>,
    cursor: Option<Cursor>,
    settings: RoomSettings,
    successor: Option<ParticipantId>,
    next_join_seq: u64,
}

impl Room {
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            roster: Vec::new(),
            queue: Vec::new(),
            cursor: None,
            settings: RoomSettings::default(),
            successor: None,
            next_join_seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn queue(&self) -> &[TrackId] {
        &self.queue
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn contains(&self, participant: &str) -> bool {
        self.roster.iter().any(|p| p.id == participant)
    }

    pub fn host(&self) -> Option<&Participant> {
        self.roster.iter().find(|p| p.role == Role::Host)
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    /// 참가. 이미 로스터에 있으면 false. 호스트가 없으면 호스트가 된다.
    pub fn join(&mut self, participant: &str, now_ms: u64) -> bool {
        if self.contains(participant) {
            return false;
        }
        let role = if self.host().is_none() {
            Role::Host
        } else {
            Role::Guest
        };
        self.roster.push(Participant {
            id: participant.to_string(),
            role,
            joined_at: now_ms,
            join_seq: self.next_join_seq,
        });
        self.next_join_seq += 1;
        self.bump();
        true
    }

    /// 퇴장. 호스트가 나가면 지정된 후계자, 없으면 가장 오래 머문 참가자가 호스트가 된다.
    pub fn leave(&mut self, participant: &str) -> bool {
        let Some(idx) = self.roster.iter().position(|p| p.id == participant) else {
            return false;
        };
        let left = self.roster.remove(idx);
        if self.successor.as_deref() == Some(participant) {
            self.successor = None;
        }

        if left.role == Role::Host && !self.roster.is_empty() {
            let next = self
                .successor
                .take()
                .and_then(|s| self.roster.iter().position(|p| p.id == s))
                .or_else(|| {
                    self.roster
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| p.join_seq)
                        .map(|(i, _)| i)
                });
            if let Some(i) = next {
                self.roster[i].role = Role::Host;
            }
        }
        self.bump();
        true
    }

    /// 버전 검사 후 제어 이벤트를 적용한다. 실패하면 상태는 바뀌지 않는다.
    pub fn apply(
        &mut self,
        actor: &str,
        expected_version: u64,
        command: RoomCommand,
        now_ms: u64,
    ) -> Result<u64, RoomError> {
        let role = self
            .roster
            .iter()
            .find(|p| p.id == actor)
            .map(|p| p.role)
            .ok_or(RoomError::NotAllowed)?;

        if expected_version != self.version {
            return Err(RoomError::StaleRoomEvent {
                current_version: self.version,
            });
        }

        if !self.permits(role, &command) {
            return Err(RoomError::NotAllowed);
        }

        match command {
            RoomCommand::Play => {
                let cursor = self.require_cursor()?;
                let position = cursor.position_at(now_ms);
                self.cursor = Some(Cursor::at(cursor.track_id.clone(), position, true, now_ms));
            }
            RoomCommand::Pause => {
                let cursor = self.require_cursor()?;
                let position = cursor.position_at(now_ms);
                self.cursor = Some(Cursor::at(cursor.track_id.clone(), position, false, now_ms));
            }
            RoomCommand::Seek { position_sec } => {
                if !position_sec.is_finite() || position_sec < 0.0 {
                    return Err(RoomError::InvalidEvent("seek position must be >= 0".into()));
                }
                let cursor = self.require_cursor()?;
                self.cursor = Some(Cursor::at(
                    cursor.track_id.clone(),
                    position_sec,
                    cursor.playing,
                    now_ms,
                ));
            }
            RoomCommand::Skip { direction } => {
                let cursor = self.require_cursor()?;
                let idx = self
                    .queue
                    .iter()
                    .position(|t| *t == cursor.track_id)
                    .unwrap_or(0);
                let target = match direction {
                    SkipDirection::Next => idx + 1,
                    SkipDirection::Previous => idx
                        .checked_sub(1)
                        .ok_or_else(|| RoomError::InvalidEvent("no previous track".into()))?,
                };
                let track_id = self
                    .queue
                    .get(target)
                    .cloned()
                    .ok_or_else(|| RoomError::InvalidEvent("no next track".into()))?;
                self.cursor = Some(Cursor::at(track_id, 0.0, true, now_ms));
            }
            RoomCommand::QueueAdd { track_id, position } => {
                if track_id.trim().is_empty() {
                    return Err(RoomError::InvalidEvent("track id is required".into()));
                }
                if self.queue.contains(&track_id) {
                    return Err(RoomError::InvalidEvent("track already queued".into()));
                }
                match position {
                    Some(p) if p <= self.queue.len() => self.queue.insert(p, track_id.clone()),
                    _ => self.queue.push(track_id.clone()),
                }
                if self.cursor.is_none() {
                    self.cursor = Some(Cursor::at(track_id, 0.0, false, now_ms));
                }
            }
            RoomCommand::QueueRemove { track_id } => {
                let idx = self
                    .queue
                    .iter()
                    .position(|t| *t == track_id)
                    .ok_or_else(|| RoomError::InvalidEvent("track not in queue".into()))?;
                self.queue.remove(idx);

                let removed_current = self
                    .cursor
                    .as_ref()
                    .map(|c| c.track_id == track_id)
                    .unwrap_or(false);
                if removed_current {
                    let playing = self.cursor.as_ref().map(|c| c.playing).unwrap_or(false);
                    self.cursor = if self.queue.is_empty() {
                        None
                    } else {
                        let next = self.queue[idx.min(self.queue.len() - 1)].clone();
                        Some(Cursor::at(next, 0.0, playing, now_ms))
                    };
                }
            }
            RoomCommand::QueueReorder { queue } => {
                let mut proposed = queue.clone();
                let mut current = self.queue.clone();
                proposed.sort();
                current.sort();
                if proposed != current {
                    return Err(RoomError::InvalidEvent(
                        "reorder must be a permutation of the queue".into(),
                    ));
                }
                self.queue = queue;
            }
            RoomCommand::UpdateSettings(patch) => {
                if let Some(v) = patch.allow_playback {
                    self.settings.allow_playback = v;
                }
                if let Some(v) = patch.allow_seek {
                    self.settings.allow_seek = v;
                }
                if let Some(v) = patch.allow_queue_edit {
                    self.settings.allow_queue_edit = v;
                }
            }
            RoomCommand::DesignateSuccessor { participant_id } => {
                if let Some(id) = &participant_id {
                    if id == actor || !self.contains(id) {
                        return Err(RoomError::InvalidEvent(
                            "successor must be another participant".into(),
                        ));
                    }
                }
                self.successor = participant_id;
            }
        }

        self.bump();
        Ok(self.version)
    }

    fn require_cursor(&self) -> Result<&Cursor, RoomError> {
        self.cursor
            .as_ref()
            .ok_or_else(|| RoomError::InvalidEvent("queue is empty".into()))
    }

    fn permits(&self, role: Role, command: &RoomCommand) -> bool {
        if role == Role::Host {
            return true;
        }
        match command {
            RoomCommand::Play | RoomCommand::Pause | RoomCommand::Skip { .. } => {
                self.settings.allow_playback
            }
            RoomCommand::Seek { .. } => self.settings.allow_seek,
            RoomCommand::QueueAdd { .. }
            | RoomCommand::QueueRemove { .. }
            | RoomCommand::QueueReorder { .. } => self.settings.allow_queue_edit,
            RoomCommand::UpdateSettings(_) | RoomCommand::DesignateSuccessor { .. } => false,
        }
    }

    pub fn snapshot(&self, now_ms: u64) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            version: self.version,
            cursor: self.cursor.as_ref().map(|c| CursorView {
                track_id: c.track_id.clone(),
                position_sec: c.position_at(now_ms),
                offset_sec: c.offset_sec,
                anchor_ms: c.anchor_ms,
                playing: c.playing,
            }),
            queue: self.queue.clone(),
            roster: self.roster.clone(),
            settings: self.settings,
            successor: self.successor.clone(),
            server_time_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_with(participants: &[&str]) -> Room {
        let mut room = Room::new("r1");
        for (i, p) in participants.iter().enumerate() {
            room.join(p, 1_000 + i as u64);
        }
        room
    }

    fn queue(room: &mut Room, actor: &str, tracks: &[&str], now: u64) {
        for t in tracks {
            let v = room.version();
            room.apply(
                actor,
                v,
                RoomCommand::QueueAdd {
                    track_id: t.to_string(),
                    position: None,
                },
                now,
            )
            .unwrap();
        }
    }

    #[test]
    fn test_first_joiner_is_host() {
        let room = room_with(&["alice", "bob"]);
        assert_eq!(room.host().unwrap().id, "alice");
        assert_eq!(room.roster()[1].role, Role::Guest);
        assert_eq!(room.version(), 2);
    }

    #[test]
    fn test_rejoin_is_noop() {
        let mut room = room_with(&["alice"]);
        assert!(!room.join("alice", 5_000));
        assert_eq!(room.version(), 1);
    }

    #[test]
    fn test_derived_position() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1"], 0);
        let v = room.version();
        room.apply("alice", v, RoomCommand::Play, 10_000).unwrap();

        let cursor = room.cursor().unwrap();
        assert_eq!(cursor.position_at(10_000), 0.0);
        assert_eq!(cursor.position_at(40_000), 30.0);

        let v = room.version();
        room.apply("alice", v, RoomCommand::Pause, 40_000).unwrap();
        let cursor = room.cursor().unwrap();
        assert!(!cursor.playing);
        assert_eq!(cursor.position_at(99_000), 30.0);
    }

    #[test]
    fn test_concurrent_pause_one_wins() {
        let mut room = room_with(&["alice", "bob"]);
        queue(&mut room, "alice", &["T1", "T2"], 0);
        let v = room.version();
        room.apply("alice", v, RoomCommand::Skip { direction: SkipDirection::Next }, 0)
            .unwrap();
        assert_eq!(room.version(), 5);
        assert_eq!(room.cursor().unwrap().track_id, "T2");
        assert_eq!(room.cursor().unwrap().position_at(30_000), 30.0);

        assert_eq!(room.apply("alice", 5, RoomCommand::Pause, 30_000).unwrap(), 6);
        let before = room.clone().snapshot(30_000);
        let err = room.apply("bob", 5, RoomCommand::Pause, 30_001).unwrap_err();
        assert!(matches!(err, RoomError::StaleRoomEvent { current_version: 6 }));

        let after = room.snapshot(30_000);
        assert_eq!(after.version, before.version);
        assert_eq!(after.cursor.unwrap().offset_sec, 30.0);
    }

    #[test]
    fn test_stale_event_never_mutates() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1"], 0);
        let v = room.version();
        let err = room
            .apply(
                "alice",
                v - 1,
                RoomCommand::QueueAdd {
                    track_id: "T9".into(),
                    position: None,
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, RoomError::StaleRoomEvent { .. }));
        assert_eq!(room.queue(), &["T1".to_string()]);
        assert_eq!(room.version(), v);
    }

    #[test]
    fn test_seek_keeps_play_state() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1"], 0);
        let v = room.version();
        room.apply("alice", v, RoomCommand::Play, 0).unwrap();
        let v = room.version();
        room.apply("alice", v, RoomCommand::Seek { position_sec: 90.0 }, 5_000)
            .unwrap();
        let cursor = room.cursor().unwrap();
        assert!(cursor.playing);
        assert_eq!(cursor.position_at(6_000), 91.0);

        let v = room.version();
        assert!(matches!(
            room.apply("alice", v, RoomCommand::Seek { position_sec: -1.0 }, 0),
            Err(RoomError::InvalidEvent(_))
        ));
        assert_eq!(room.version(), v);
    }

    #[test]
    fn test_skip_bounds() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1", "T2"], 0);
        let v = room.version();
        assert!(matches!(
            room.apply("alice", v, RoomCommand::Skip { direction: SkipDirection::Previous }, 0),
            Err(RoomError::InvalidEvent(_))
        ));
        room.apply("alice", v, RoomCommand::Skip { direction: SkipDirection::Next }, 0)
            .unwrap();
        let v = room.version();
        assert!(room
            .apply("alice", v, RoomCommand::Skip { direction: SkipDirection::Next }, 0)
            .is_err());
        room.apply("alice", v, RoomCommand::Skip { direction: SkipDirection::Previous }, 0)
            .unwrap();
        assert_eq!(room.cursor().unwrap().track_id, "T1");
    }

    #[test]
    fn test_queue_remove_moves_cursor_or_clears() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1", "T2"], 0);
        assert_eq!(room.cursor().unwrap().track_id, "T1");

        let v = room.version();
        room.apply("alice", v, RoomCommand::QueueRemove { track_id: "T1".into() }, 0)
            .unwrap();
        assert_eq!(room.cursor().unwrap().track_id, "T2");

        let v = room.version();
        room.apply("alice", v, RoomCommand::QueueRemove { track_id: "T2".into() }, 0)
            .unwrap();
        assert!(room.cursor().is_none());
        assert!(room.queue().is_empty());

        let v = room.version();
        assert!(matches!(
            room.apply("alice", v, RoomCommand::Play, 0),
            Err(RoomError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_queue_add_position_and_reorder() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1", "T3"], 0);
        let v = room.version();
        room.apply(
            "alice",
            v,
            RoomCommand::QueueAdd {
                track_id: "T2".into(),
                position: Some(1),
            },
            0,
        )
        .unwrap();
        assert_eq!(room.queue(), &["T1", "T2", "T3"]);

        let v = room.version();
        assert!(room
            .apply(
                "alice",
                v,
                RoomCommand::QueueReorder {
                    queue: vec!["T1".into(), "T2".into()],
                },
                0,
            )
            .is_err());
        room.apply(
            "alice",
            v,
            RoomCommand::QueueReorder {
                queue: vec!["T3".into(), "T1".into(), "T2".into()],
            },
            0,
        )
        .unwrap();
        assert_eq!(room.queue(), &["T3", "T1", "T2"]);
    }

    #[test]
    fn test_guest_permissions_follow_settings() {
        let mut room = room_with(&["alice", "bob"]);
        queue(&mut room, "alice", &["T1"], 0);

        let v = room.version();
        room.apply(
            "alice",
            v,
            RoomCommand::UpdateSettings(SettingsPatch {
                allow_seek: Some(false),
                ..Default::default()
            }),
            0,
        )
        .unwrap();

        let v = room.version();
        assert!(matches!(
            room.apply("bob", v, RoomCommand::Seek { position_sec: 3.0 }, 0),
            Err(RoomError::NotAllowed)
        ));
        assert!(matches!(
            room.apply("bob", v, RoomCommand::UpdateSettings(SettingsPatch::default()), 0),
            Err(RoomError::NotAllowed)
        ));
        room.apply("bob", v, RoomCommand::Play, 0).unwrap();
        assert!(matches!(
            room.apply("mallory", room.version(), RoomCommand::Pause, 0),
            Err(RoomError::NotAllowed)
        ));
    }

    #[test]
    fn test_host_succession_longest_joined() {
        let mut room = room_with(&["alice", "bob", "carol"]);
        assert!(room.leave("alice"));
        assert_eq!(room.host().unwrap().id, "bob");
        assert_eq!(room.roster().len(), 2);
        assert!(!room.leave("alice"));
    }

    #[test]
    fn test_host_succession_designated() {
        let mut room = room_with(&["alice", "bob", "carol"]);
        let v = room.version();
        room.apply(
            "alice",
            v,
            RoomCommand::DesignateSuccessor {
                participant_id: Some("carol".into()),
            },
            0,
        )
        .unwrap();
        room.leave("alice");
        assert_eq!(room.host().unwrap().id, "carol");
        assert_eq!(room.snapshot(0).successor, None);
    }

    #[test]
    fn test_guest_leave_keeps_host() {
        let mut room = room_with(&["alice", "bob"]);
        room.leave("bob");
        assert_eq!(room.host().unwrap().id, "alice");
        room.leave("alice");
        assert!(room.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut room = room_with(&["alice"]);
        queue(&mut room, "alice", &["T1"], 0);
        let json = serde_json::to_value(room.snapshot(2_000)).unwrap();
        assert_eq!(json["version"], 2);
        assert_eq!(json["queue"][0], "T1");
        assert_eq!(json["cursor"]["trackId"], "T1");
        assert_eq!(json["roster"][0]["role"], "host");
        assert!(json["roster"][0].get("joinSeq").is_none());
        assert_eq!(json["settings"]["allowSeek"], true);
    }
}
