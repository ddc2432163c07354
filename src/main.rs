//! 채널 기반 오디오 스트리밍 및 청취방 서버

mod backend;
mod catalog;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod ingest;
mod pool;
mod protocol;
mod room;
mod state;

use anyhow::{bail, Context};
use backend::FsBackend;
use catalog::{CatalogStore, JsonFileStore, MemoryStore, TrackLocator};
use config::Config;
use ingest::IngestFeeder;
use pool::{ClientPool, SessionSlot};
use state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 세션 풀 구성
    if config.sessions.is_empty() {
        bail!("no sessions configured (SESSION_IDS is empty)");
    }
    let slots = config
        .sessions
        .iter()
        .map(|s| {
            let backend = Arc::new(FsBackend::new(
                &config.storage_root,
                s.token.clone(),
                s.channels.clone(),
            ));
            SessionSlot::new(s.id.clone(), s.channels.clone(), backend)
        })
        .collect();
    let pool = Arc::new(ClientPool::new(
        slots,
        config.channels.dump,
        config.health.failure_threshold,
    ));

    let health = pool.probe_all().await;
    if health.healthy == 0 {
        bail!("no session credentials validated ({} configured)", health.total);
    }
    tracing::info!(healthy = health.healthy, total = health.total, "Session pool ready");

    // 카탈로그 로드
    let store: Arc<dyn CatalogStore> = match &config.catalog_path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => {
            tracing::warn!("CATALOG_PATH not set, catalog will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };
    let catalog = Arc::new(
        TrackLocator::load(store)
            .await
            .context("failed to load track catalog")?,
    );

    let state = Arc::new(AppState::new(config.clone(), pool.clone(), catalog.clone()));
    let cancel = CancellationToken::new();

    // 백그라운드 태스크
    let feeder = Arc::new(IngestFeeder::new(
        catalog,
        pool.clone(),
        config.channels.sources.clone(),
        config.channels.multi_clients,
    ));
    let tasks = vec![
        pool::spawn_health_probe(pool, config.health.probe_interval, cancel.clone()),
        ingest::spawn_ingest(feeder, config.ingest_interval, cancel.clone()),
        room::spawn_reaper(state.rooms.clone(), config.room.reap_interval, cancel.clone()),
    ];

    let app = handlers::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("Chanstream server started");
    tracing::info!("Address: {}", addr);
    tracing::info!("Stream: http://{}/stream/:track_id", addr);
    tracing::info!("Rooms: ws://{}/rooms/:room_id/ws", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
