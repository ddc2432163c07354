//! 트랙 로케이터
//!
//! 트랙 ID → 보유 세션(holder) 목록과 크기/길이 메타데이터.
//! 트랙은 최초 관찰 시 생성되고 이후 holder 추가 외에는 변경되지 않는다.

pub mod store;

use crate::backend::{ChannelId, FileLocation};
use crate::error::StoreError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

pub use store::{CatalogStore, JsonFileStore, MemoryStore};

pub type TrackId = String;
pub type SessionId = String;

/// 트랙을 제공할 수 있는 세션과 그 세션에서의 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub session: SessionId,
    pub location: FileLocation,
}

/// 카탈로그 트랙
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub source: FileLocation,
    pub holders: Vec<Holder>,
    pub size: u64,
    pub duration_sec: Option<f64>,
    pub mime_type: String,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub created_at: u64,
    /// 메타데이터 지문. 제목이 없으면 None.
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// 같은 지문으로 합쳐진 다른 소스 메시지
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<FileLocation>,
}

impl Track {
    /// 덤프 채널에 복사본이 있는지
    pub fn overflow_location(&self, dump_channel: Option<ChannelId>) -> Option<FileLocation> {
        let dump = dump_channel?;
        self.holders
            .iter()
            .map(|h| h.location)
            .find(|l| l.channel_id == dump)
    }
}

/// 새 트랙 등록 요청
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub source: FileLocation,
    pub holder: Holder,
    pub size: u64,
    pub duration_sec: Option<f64>,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub performer: Option<String>,
}

/// 소스 메시지에서 안정적인 트랙 ID를 만든다
pub fn track_id_for(source: &FileLocation) -> TrackId {
    let digest = Sha1::digest(format!("{}:{}", source.channel_id, source.message_id).as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}

/// 소문자 영숫자 토큰만 남긴다
pub fn normalize_text(value: &str) -> String {
    value
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 재업로드된 같은 파일을 알아보는 지문
///
/// 정규화한 제목, 연주자, 2초 단위로 반올림한 길이, 바이트 크기를 잇는다.
/// 제목이 비어 있으면 만들지 않는다.
pub fn metadata_fingerprint(
    title: Option<&str>,
    performer: Option<&str>,
    duration_sec: Option<f64>,
    size: u64,
) -> Option<String> {
    let title = normalize_text(title.unwrap_or_default());
    if title.is_empty() {
        return None;
    }
    let performer = normalize_text(performer.unwrap_or_default());
    let duration = duration_sec
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| (((d / DURATION_BUCKET_SECS).round() * DURATION_BUCKET_SECS) as u64).to_string())
        .unwrap_or_default();
    Some(format!("{}|{}|{}|{}", title, performer, duration, size))
}

const DURATION_BUCKET_SECS: f64 = 2.0;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 50;

/// 목록 조회 조건
#[derive(Debug, Clone, Default)]
pub struct TrackQuery {
    pub text: Option<String>,
    pub channel_id: Option<ChannelId>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

/// 목록 한 페이지
#[derive(Debug, Clone)]
pub struct TrackPage {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub items: Vec<Track>,
}

enum Registration {
    Known(TrackId),
    Created(TrackId),
    Merged(TrackId),
}

impl Registration {
    fn track_id(&self) -> &TrackId {
        match self {
            Registration::Known(id) | Registration::Created(id) | Registration::Merged(id) => id,
        }
    }
}

/// 트랙 조회 테이블
pub struct TrackLocator {
    tracks: DashMap<TrackId, Track>,
    by_source: DashMap<FileLocation, TrackId>,
    /// 잠금 순서: by_source → by_fingerprint
    by_fingerprint: DashMap<String, TrackId>,
    store: Arc<dyn CatalogStore>,
    persist_lock: Mutex<()>,
}

impl TrackLocator {
    /// 저장소에서 레지스트리를 읽어 로케이터를 만든다
    pub async fn load(store: Arc<dyn CatalogStore>) -> Result<Self, StoreError> {
        let locator = Self {
            tracks: DashMap::new(),
            by_source: DashMap::new(),
            by_fingerprint: DashMap::new(),
            store,
            persist_lock: Mutex::new(()),
        };
        for track in locator.store.load().await? {
            if track.holders.is_empty() {
                tracing::warn!(track_id = %track.id, "Skipping stored track without holders");
                continue;
            }
            locator.by_source.insert(track.source, track.id.clone());
            for alias in &track.aliases {
                locator.by_source.insert(*alias, track.id.clone());
            }
            if let Some(fingerprint) = &track.fingerprint {
                locator
                    .by_fingerprint
                    .entry(fingerprint.clone())
                    .or_insert_with(|| track.id.clone());
            }
            locator.tracks.insert(track.id.clone(), track);
        }
        Ok(locator)
    }

    pub fn get(&self, track_id: &str) -> Option<Track> {
        self.tracks.get(track_id).map(|t| t.clone())
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.contains_key(track_id)
    }

    pub fn lookup_source(&self, source: &FileLocation) -> Option<TrackId> {
        self.by_source.get(source).map(|id| id.clone())
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// 최근 등록 순 목록. 검색어의 모든 토큰이 제목이나 연주자에 있어야 한다.
    pub fn search(&self, query: &TrackQuery) -> TrackPage {
        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let page = query.page.unwrap_or(1).max(1);
        let tokens: Vec<String> = query
            .text
            .as_deref()
            .map(normalize_text)
            .unwrap_or_default()
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let mut matched: Vec<Track> = self
            .tracks
            .iter()
            .filter(|t| query.channel_id.map_or(true, |c| t.source.channel_id == c))
            .filter(|t| {
                if tokens.is_empty() {
                    return true;
                }
                let haystack = normalize_text(&format!(
                    "{} {}",
                    t.title.as_deref().unwrap_or_default(),
                    t.performer.as_deref().unwrap_or_default()
                ));
                let words: Vec<&str> = haystack.split(' ').collect();
                tokens
                    .iter()
                    .all(|token| words.iter().any(|w| w.starts_with(token.as_str())))
            })
            .map(|t| t.clone())
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        TrackPage {
            page,
            per_page,
            total,
            items,
        }
    }

    /// 트랙 등록. 같은 소스 메시지는 한 번만 생성된다 (created 여부 반환)
    pub async fn register(&self, new: NewTrack) -> Result<(TrackId, bool), StoreError> {
        let outcome = match self.by_source.entry(new.source) {
            Entry::Occupied(existing) => Registration::Known(existing.get().clone()),
            Entry::Vacant(slot) => {
                let fingerprint = metadata_fingerprint(
                    new.title.as_deref(),
                    new.performer.as_deref(),
                    new.duration_sec,
                    new.size,
                );
                // 지문 항목은 트랙이 들어갈 때까지 잡고 있는다
                let outcome = match fingerprint.clone().map(|f| self.by_fingerprint.entry(f)) {
                    // 다른 메시지로 다시 올라온 같은 파일은 기존 트랙에 합친다
                    Some(Entry::Occupied(existing)) => {
                        let track_id = existing.get().clone();
                        if let Some(mut track) = self.tracks.get_mut(&track_id) {
                            track.aliases.push(new.source);
                        }
                        Registration::Merged(track_id)
                    }
                    Some(Entry::Vacant(fingerprint_slot)) => {
                        let track_id = self.insert_track(&new, fingerprint);
                        fingerprint_slot.insert(track_id.clone());
                        Registration::Created(track_id)
                    }
                    None => Registration::Created(self.insert_track(&new, None)),
                };
                slot.insert(outcome.track_id().clone());
                outcome
            }
        };

        match outcome {
            Registration::Created(track_id) => {
                tracing::info!(track_id = %track_id, source = %new.source, "Track registered");
                self.persist(&track_id).await?;
                Ok((track_id, true))
            }
            Registration::Merged(track_id) => {
                tracing::info!(
                    track_id = %track_id,
                    source = %new.source,
                    "Duplicate upload merged into existing track"
                );
                if !self.add_holder(&track_id, new.holder).await? {
                    self.persist(&track_id).await?;
                }
                Ok((track_id, false))
            }
            Registration::Known(track_id) => {
                self.add_holder(&track_id, new.holder).await?;
                Ok((track_id, false))
            }
        }
    }

    fn insert_track(&self, new: &NewTrack, fingerprint: Option<String>) -> TrackId {
        let track_id = track_id_for(&new.source);
        self.tracks.insert(
            track_id.clone(),
            Track {
                id: track_id.clone(),
                source: new.source,
                holders: vec![new.holder.clone()],
                size: new.size,
                duration_sec: new.duration_sec,
                mime_type: new
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "audio/mpeg".to_string()),
                title: new.title.clone(),
                performer: new.performer.clone(),
                created_at: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default(),
                fingerprint,
                aliases: Vec::new(),
            },
        );
        track_id
    }

    /// holder 추가 (이미 있으면 false)
    pub async fn add_holder(&self, track_id: &str, holder: Holder) -> Result<bool, StoreError> {
        let added = match self.tracks.get_mut(track_id) {
            Some(mut track) if !track.holders.contains(&holder) => {
                track.holders.push(holder.clone());
                true
            }
            _ => false,
        };
        if added {
            tracing::debug!(
                track_id = %track_id,
                session = %holder.session,
                location = %holder.location,
                "Holder added"
            );
            self.persist(track_id).await?;
        }
        Ok(added)
    }

    async fn persist(&self, track_id: &str) -> Result<(), StoreError> {
        // 잠금 안에서 최신 상태를 복제해 늦게 도착한 스냅샷이 덮어쓰지 않게 한다
        let _guard = self.persist_lock.lock().await;
        let Some(track) = self.get(track_id) else {
            return Ok(());
        };
        self.store.put(&track).await
    }
}
