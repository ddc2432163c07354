//! 카탈로그 영속화 (키-값 저장소)

use super::{Track, TrackId};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// 트랙 레지스트리를 보관하는 키-값 저장소
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// 저장된 트랙 전체를 읽는다. 실패하면 기동을 중단한다.
    async fn load(&self) -> Result<Vec<Track>, StoreError>;

    /// 트랙 하나를 덮어쓴다
    async fn put(&self, track: &Track) -> Result<(), StoreError>;
}

/// 휘발성 저장소 (CATALOG_PATH 미설정 시, 테스트)
#[derive(Debug, Default)]
pub struct MemoryStore {
    tracks: Mutex<BTreeMap<TrackId, Track>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Track>, StoreError> {
        Ok(self.tracks.lock().await.values().cloned().collect())
    }

    async fn put(&self, track: &Track) -> Result<(), StoreError> {
        self.tracks
            .lock()
            .await
            .insert(track.id.clone(), track.clone());
        Ok(())
    }
}

/// JSON 파일 하나에 전체 레지스트리를 기록하는 저장소
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tracks: Mutex<BTreeMap<TrackId, Track>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tracks: Mutex::new(BTreeMap::new()),
        }
    }

    async fn flush(&self, tracks: &BTreeMap<TrackId, Track>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(tracks)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Track>, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let loaded: BTreeMap<TrackId, Track> = match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut tracks = self.tracks.lock().await;
        *tracks = loaded;
        // 쓰기 가능 여부를 기동 시점에 확인
        self.flush(&tracks).await?;

        tracing::info!(path = %self.path.display(), tracks = tracks.len(), "Catalog loaded");
        Ok(tracks.values().cloned().collect())
    }

    async fn put(&self, track: &Track) -> Result<(), StoreError> {
        let mut tracks = self.tracks.lock().await;
        tracks.insert(track.id.clone(), track.clone());
        self.flush(&tracks).await
    }
}
