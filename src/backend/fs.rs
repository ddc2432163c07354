//! 파일 시스템 채널 저장소
//!
//! `root/<channel_id>/<message_id>[-name].<ext>` 레이아웃을 채널/메시지로 본다.

use super::{ChannelId, FileLocation, MediaMessage, SessionBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// 디렉터리 기반 세션 백엔드
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    token: String,
    scope: HashSet<ChannelId>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>, token: impl Into<String>, scope: HashSet<ChannelId>) -> Self {
        Self {
            root: root.into(),
            token: token.into(),
            scope,
        }
    }

    fn check_auth(&self) -> Result<(), BackendError> {
        if self.token.trim().is_empty() {
            return Err(BackendError::Unauthorized);
        }
        Ok(())
    }

    fn channel_dir(&self, channel_id: ChannelId) -> Result<PathBuf, BackendError> {
        self.check_auth()?;
        if !self.scope.contains(&channel_id) {
            return Err(BackendError::Forbidden(channel_id));
        }
        Ok(self.root.join(channel_id.to_string()))
    }

    async fn resolve(&self, location: &FileLocation) -> Result<PathBuf, BackendError> {
        let dir = self.channel_dir(location.channel_id)?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if parse_message_id(name) == Some(location.message_id) {
                    return Ok(entry.path());
                }
            }
        }
        Err(BackendError::NotFound {
            channel_id: location.channel_id,
            message_id: location.message_id,
        })
    }
}

#[async_trait]
impl SessionBackend for FsBackend {
    async fn probe(&self) -> Result<(), BackendError> {
        self.check_auth()?;
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BackendError::Unreachable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(BackendError::Unreachable(e.to_string())),
        }
    }

    async fn fetch_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        max_len: u64,
    ) -> Result<Bytes, BackendError> {
        let path = self.resolve(location).await?;
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = BytesMut::with_capacity(max_len as usize);
        let mut reader = file.take(max_len);
        while reader.read_buf(&mut buf).await? > 0 {}
        Ok(buf.freeze())
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        after: i64,
    ) -> Result<Vec<MediaMessage>, BackendError> {
        let dir = self.channel_dir(channel_id)?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(message_id) = parse_message_id(&name) else {
                continue;
            };
            if message_id <= after {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(MediaMessage {
                location: FileLocation::new(channel_id, message_id),
                size: meta.len(),
                duration_sec: None,
                mime_type: mime_for(&name).map(str::to_string),
                title: title_from_name(&name),
                performer: None,
                file_name: Some(name),
            });
        }
        out.sort_by_key(|m| m.location.message_id);
        Ok(out)
    }

    async fn copy_to_channel(
        &self,
        location: &FileLocation,
        dest: ChannelId,
    ) -> Result<FileLocation, BackendError> {
        let src = self.resolve(location).await?;
        let dest_dir = self.channel_dir(dest)?;
        tokio::fs::create_dir_all(&dest_dir).await?;

        let ext = src
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();

        let mut next = max_message_id(&dest_dir).await? + 1;
        // 다른 세션이 같은 번호를 먼저 가져갈 수 있으므로 create_new로 선점한다
        loop {
            let target = dest_dir.join(format!("{}{}", next, ext));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
            {
                Ok(mut out) => {
                    let mut input = tokio::fs::File::open(&src).await?;
                    tokio::io::copy(&mut input, &mut out).await?;
                    tracing::debug!(from = %location, to = %target.display(), "Copied message");
                    return Ok(FileLocation::new(dest, next));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => next += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

async fn max_message_id(dir: &Path) -> Result<i64, BackendError> {
    let mut max = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = entry.file_name().to_str().and_then(parse_message_id) {
            max = max.max(id);
        }
    }
    Ok(max)
}

/// `123-title.mp3` / `123.mp3` → 123
fn parse_message_id(name: &str) -> Option<i64> {
    let end = name.find(['-', '.']).unwrap_or(name.len());
    name[..end].parse().ok()
}

fn title_from_name(name: &str) -> Option<String> {
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    let (_, title) = stem.split_once('-')?;
    let title = title.trim().replace('_', " ");
    (!title.is_empty()).then_some(title)
}

fn mime_for(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" => Some("audio/mpeg"),
        "flac" => Some("audio/flac"),
        "m4a" | "aac" => Some("audio/mp4"),
        "ogg" | "oga" | "opus" => Some("audio/ogg"),
        "wav" => Some("audio/wav"),
        _ => None,
    }
}
