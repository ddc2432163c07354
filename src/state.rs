//! 애플리케이션 상태 관리

use crate::catalog::TrackLocator;
use crate::config::Config;
use crate::dispatcher::StreamDispatcher;
use crate::pool::ClientPool;
use crate::room::RoomManager;
use std::sync::Arc;

/// 전역 애플리케이션 상태
pub struct AppState {
    /// 설정
    pub config: Arc<Config>,
    /// 세션 풀
    pub pool: Arc<ClientPool>,
    /// 트랙 로케이터
    pub catalog: Arc<TrackLocator>,
    pub dispatcher: StreamDispatcher,
    /// 활성 방 (room_id -> Room)
    pub rooms: Arc<RoomManager>,
}

impl AppState {
    pub fn new(config: Config, pool: Arc<ClientPool>, catalog: Arc<TrackLocator>) -> Self {
        let dispatcher = StreamDispatcher::new(
            catalog.clone(),
            pool.clone(),
            config.stream.chunk_size,
            config.stream.buffer_chunks,
        );
        let rooms = Arc::new(RoomManager::new(
            catalog.clone(),
            config.room.max_size,
            config.room.grace,
        ));
        Self {
            config: Arc::new(config),
            pool,
            catalog,
            dispatcher,
            rooms,
        }
    }
}
