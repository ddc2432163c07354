//! 핸들러 테스트용 앱 상태

use crate::backend::memory::{MemoryBackend, MemoryChannels};
use crate::backend::FileLocation;
use crate::catalog::{Holder, MemoryStore, NewTrack, TrackLocator};
use crate::config::Config;
use crate::pool::{ClientPool, SessionSlot};
use crate::state::AppState;
use std::sync::Arc;

pub(crate) const SRC: i64 = 100;

pub(crate) struct TestApp {
    pub state: Arc<AppState>,
    pub track_id: String,
    pub data: Vec<u8>,
}

/// 세션 A, B와 10,000바이트 트랙 하나
pub(crate) async fn test_app() -> TestApp {
    test_app_with(|_| {}).await
}

pub(crate) async fn test_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let channels = MemoryChannels::new();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let location = FileLocation::new(SRC, 1);
    channels.put(location, data.clone(), "audio/mpeg");

    let slots = ["A", "B"]
        .into_iter()
        .map(|id| {
            let backend = Arc::new(MemoryBackend::new(channels.clone(), &[SRC]));
            SessionSlot::new(id, [SRC].into(), backend)
        })
        .collect();
    let pool = Arc::new(ClientPool::new(slots, None, 3));

    let catalog = TrackLocator::load(Arc::new(MemoryStore::new())).await.unwrap();
    let (track_id, _) = catalog
        .register(NewTrack {
            source: location,
            holder: Holder {
                session: "A".into(),
                location,
            },
            size: data.len() as u64,
            duration_sec: Some(10.0),
            mime_type: Some("audio/mpeg".into()),
            title: Some("Night Drive".into()),
            performer: Some("Kim".into()),
        })
        .await
        .unwrap();

    let mut config = Config::from_env();
    config.cors_origins = vec!["*".into()];
    config.stream.chunk_size = 1024;
    config.room.max_size = 50;
    configure(&mut config);
    let state = Arc::new(AppState::new(config, pool, Arc::new(catalog)));
    TestApp {
        state,
        track_id,
        data,
    }
}
