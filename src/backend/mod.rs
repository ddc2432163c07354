//! 백엔드 세션 경계
//!
//! 메시징 플랫폼이 오디오 바이트의 저장소다. 세션 하나가 인증된 봇 클라이언트 하나에
//! 해당하며, 자신의 스코프(읽을 수 있는 채널 집합) 안에서만 파일을 가져올 수 있다.

pub mod fs;
#[cfg(test)]
pub mod memory;

use crate::error::BackendError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use fs::FsBackend;

/// 채널 식별자
pub type ChannelId = i64;

/// 채널 안의 메시지 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileLocation {
    pub channel_id: ChannelId,
    pub message_id: i64,
}

impl FileLocation {
    pub fn new(channel_id: ChannelId, message_id: i64) -> Self {
        Self {
            channel_id,
            message_id,
        }
    }
}

impl std::fmt::Display for FileLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.message_id)
    }
}

/// 소스 채널에서 관찰된 미디어 메시지
#[derive(Debug, Clone)]
pub struct MediaMessage {
    pub location: FileLocation,
    pub size: u64,
    pub duration_sec: Option<f64>,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub file_name: Option<String>,
}

impl MediaMessage {
    /// audio/* 문서만 트랙으로 취급
    pub fn is_audio(&self) -> bool {
        self.mime_type
            .as_deref()
            .map(|m| m.starts_with("audio/"))
            .unwrap_or(false)
    }
}

/// 세션 하나의 원격 호출 인터페이스
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// 가벼운 생존 확인
    async fn probe(&self) -> Result<(), BackendError>;

    /// 인증이 끊긴 세션을 다시 만든다
    async fn reconnect(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// `offset`부터 최대 `max_len` 바이트를 가져온다. 짧은 읽기를 허용하며,
    /// 빈 결과는 파일 끝을 뜻한다.
    async fn fetch_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        max_len: u64,
    ) -> Result<Bytes, BackendError>;

    /// `after` 이후의 메시지를 메시지 ID 오름차순으로 반환
    async fn list_messages(
        &self,
        channel_id: ChannelId,
        after: i64,
    ) -> Result<Vec<MediaMessage>, BackendError>;

    /// 메시지를 다른 채널로 복사하고 새 위치를 반환
    async fn copy_to_channel(
        &self,
        location: &FileLocation,
        dest: ChannelId,
    ) -> Result<FileLocation, BackendError>;
}
