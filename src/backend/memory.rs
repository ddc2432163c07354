//! 테스트용 인메모리 백엔드 (장애 주입 지원)

use super::{ChannelId, FileLocation, MediaMessage, SessionBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 여러 세션이 공유하는 채널 저장소
#[derive(Debug, Default)]
pub struct MemoryChannels {
    files: Mutex<BTreeMap<FileLocation, (Bytes, Option<String>)>>,
}

impl MemoryChannels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, location: FileLocation, data: impl Into<Bytes>, mime: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(location, (data.into(), Some(mime.to_string())));
    }

    pub fn count_in(&self, channel_id: ChannelId) -> usize {
        self.files
            .lock()
            .unwrap()
            .keys()
            .filter(|l| l.channel_id == channel_id)
            .count()
    }
}

/// 세션 하나에 해당하는 인메모리 백엔드
#[derive(Debug)]
pub struct MemoryBackend {
    channels: Arc<MemoryChannels>,
    scope: HashSet<ChannelId>,
    fail_from: Mutex<Option<u64>>,
    unreachable: AtomicBool,
    unauthorized: AtomicBool,
    pub fetches: AtomicUsize,
    pub reconnects: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(channels: Arc<MemoryChannels>, scope: &[ChannelId]) -> Self {
        Self {
            channels,
            scope: scope.iter().copied().collect(),
            fail_from: Mutex::new(None),
            unreachable: AtomicBool::new(false),
            unauthorized: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// 이 오프셋 이후의 바이트 요청은 실패한다 (앞부분은 짧게 읽힌다)
    pub fn fail_from(&self, offset: u64) {
        *self.fail_from.lock().unwrap() = Some(offset);
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    pub fn set_unauthorized(&self, value: bool) {
        self.unauthorized.store(value, Ordering::SeqCst);
    }

    fn check(&self, channel_id: ChannelId) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("injected".into()));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(BackendError::Unauthorized);
        }
        if !self.scope.contains(&channel_id) {
            return Err(BackendError::Forbidden(channel_id));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn probe(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("injected".into()));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(BackendError::Unauthorized);
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BackendError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        max_len: u64,
    ) -> Result<Bytes, BackendError> {
        self.check(location.channel_id)?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let data = self
            .channels
            .files
            .lock()
            .unwrap()
            .get(location)
            .map(|(d, _)| d.clone())
            .ok_or(BackendError::NotFound {
                channel_id: location.channel_id,
                message_id: location.message_id,
            })?;

        let mut end = (offset + max_len).min(data.len() as u64);
        if let Some(fail_at) = *self.fail_from.lock().unwrap() {
            if offset >= fail_at {
                return Err(BackendError::Unreachable("connection reset".into()));
            }
            end = end.min(fail_at);
        }
        let start = offset.min(data.len() as u64);
        Ok(data.slice(start as usize..end as usize))
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        after: i64,
    ) -> Result<Vec<MediaMessage>, BackendError> {
        self.check(channel_id)?;
        let files = self.channels.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|(l, _)| l.channel_id == channel_id && l.message_id > after)
            .map(|(l, (data, mime))| MediaMessage {
                location: *l,
                size: data.len() as u64,
                duration_sec: Some(data.len() as f64 / 1000.0),
                mime_type: mime.clone(),
                title: Some(format!("track {}", l)),
                performer: None,
                file_name: None,
            })
            .collect())
    }

    async fn copy_to_channel(
        &self,
        location: &FileLocation,
        dest: ChannelId,
    ) -> Result<FileLocation, BackendError> {
        self.check(location.channel_id)?;
        self.check(dest)?;
        let mut files = self.channels.files.lock().unwrap();
        let entry = files.get(location).cloned().ok_or(BackendError::NotFound {
            channel_id: location.channel_id,
            message_id: location.message_id,
        })?;
        let next = files
            .keys()
            .filter(|l| l.channel_id == dest)
            .map(|l| l.message_id)
            .max()
            .unwrap_or(0)
            + 1;
        let target = FileLocation::new(dest, next);
        files.insert(target, entry);
        Ok(target)
    }
}
