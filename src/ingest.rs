//! 수집기
//!
//! 소스 채널을 주기적으로 폴링해 새 오디오 메시지를 카탈로그에 등록한다.
//! 일부 세션이 소스 채널을 읽지 못하면 덤프 채널에 한 번 복사해 두어
//! 모든 세션이 트랙에 닿을 수 있게 한다.

use crate::backend::{ChannelId, MediaMessage};
use crate::catalog::{Holder, NewTrack, TrackId, TrackLocator};
use crate::error::IngestError;
use crate::pool::{ClientPool, SessionSlot, MIN_TASK_INTERVAL};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// 폴링 한 번의 결과
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub registered: usize,
    pub dumped: usize,
    pub skipped: usize,
}

pub struct IngestFeeder {
    catalog: Arc<TrackLocator>,
    pool: Arc<ClientPool>,
    sources: Vec<ChannelId>,
    multi_clients: bool,
    /// 채널별 마지막 처리 메시지 ID
    cursors: Mutex<HashMap<ChannelId, i64>>,
    /// 덤프 복사에 실패해 다음 폴링에서 다시 시도할 트랙
    pending_dumps: Mutex<HashSet<TrackId>>,
}

impl IngestFeeder {
    pub fn new(
        catalog: Arc<TrackLocator>,
        pool: Arc<ClientPool>,
        sources: Vec<ChannelId>,
        multi_clients: bool,
    ) -> Self {
        Self {
            catalog,
            pool,
            sources,
            multi_clients,
            cursors: Mutex::new(HashMap::new()),
            pending_dumps: Mutex::new(HashSet::new()),
        }
    }

    /// 모든 소스 채널을 한 번 폴링한다. 채널 하나의 실패가 다른 채널을 막지 않는다.
    pub async fn poll_once(&self) -> IngestReport {
        let mut report = IngestReport::default();
        self.retry_pending_dumps(&mut report).await;
        for &channel in &self.sources {
            if let Err(e) = self.poll_channel(channel, &mut report).await {
                tracing::warn!(channel_id = channel, error = %e, "Ingest poll failed");
            }
        }
        if report.registered > 0 || report.dumped > 0 {
            tracing::info!(
                registered = report.registered,
                dumped = report.dumped,
                skipped = report.skipped,
                "Ingest poll completed"
            );
        }
        report
    }

    /// 지난 폴링에서 복사하지 못한 트랙을 다시 덤프한다
    async fn retry_pending_dumps(&self, report: &mut IngestReport) {
        let pending: Vec<TrackId> = self.pending_dumps.lock().await.iter().cloned().collect();
        for track_id in pending {
            let needed = self
                .catalog
                .get(&track_id)
                .map(|t| self.needs_dump(t.source.channel_id))
                .unwrap_or(false);
            let result = if needed {
                self.dump(&track_id, None).await
            } else {
                Ok(false)
            };
            match result {
                Ok(dumped) => {
                    self.pending_dumps.lock().await.remove(&track_id);
                    if dumped {
                        report.dumped += 1;
                    }
                }
                Err(e) => {
                    tracing::debug!(track_id = %track_id, error = %e, "Dump retry deferred");
                }
            }
        }
    }

    async fn poll_channel(
        &self,
        channel: ChannelId,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        // 가장 작은 ID의 건강한 세션이 작성자 역할을 맡는다
        let author = self
            .pool
            .sessions_reading(channel)
            .find(|s| s.is_healthy())
            .cloned()
            .ok_or(IngestError::NoAuthor(channel))?;

        let after = self.cursors.lock().await.get(&channel).copied().unwrap_or(0);
        let messages = author.backend().list_messages(channel, after).await?;

        for message in messages {
            let message_id = message.location.message_id;
            if message.is_audio() {
                let dumped = self.ingest_message(&author, message).await?;
                report.registered += 1;
                if dumped {
                    report.dumped += 1;
                }
            } else {
                tracing::debug!(location = %message.location, "Skipping non-audio message");
                report.skipped += 1;
            }
            // 성공한 메시지까지만 커서를 옮긴다
            self.cursors.lock().await.insert(channel, message_id);
        }
        Ok(())
    }

    /// 메시지 하나를 등록한다. 덤프 복사를 했으면 true.
    async fn ingest_message(
        &self,
        author: &Arc<SessionSlot>,
        message: MediaMessage,
    ) -> Result<bool, IngestError> {
        let source = message.location;
        let (track_id, _) = self
            .catalog
            .register(NewTrack {
                source,
                holder: Holder {
                    session: author.id().to_string(),
                    location: source,
                },
                size: message.size,
                duration_sec: message.duration_sec,
                mime_type: message.mime_type,
                title: message.title.or(message.file_name),
                performer: message.performer,
            })
            .await?;

        for slot in self.pool.sessions_reading(source.channel_id) {
            self.catalog
                .add_holder(
                    &track_id,
                    Holder {
                        session: slot.id().to_string(),
                        location: source,
                    },
                )
                .await?;
        }

        if !self.needs_dump(source.channel_id) {
            return Ok(false);
        }
        match self.dump(&track_id, Some(author)).await {
            Ok(dumped) => Ok(dumped),
            Err(IngestError::Store(e)) => Err(e.into()),
            Err(e) => {
                // 등록은 끝났으므로 커서는 옮기고 복사만 다음 폴링으로 미룬다
                tracing::warn!(track_id = %track_id, error = %e, "Dump copy deferred");
                self.pending_dumps.lock().await.insert(track_id);
                Ok(false)
            }
        }
    }

    fn needs_dump(&self, channel: ChannelId) -> bool {
        self.multi_clients
            && self.pool.dump_channel().is_some()
            && self.pool.slots().iter().any(|s| !s.can_read(channel))
    }

    /// 덤프 채널에 한 번 복사한다. 이미 복사본이 있으면 false.
    async fn dump(
        &self,
        track_id: &TrackId,
        author: Option<&Arc<SessionSlot>>,
    ) -> Result<bool, IngestError> {
        let Some(dump) = self.pool.dump_channel() else {
            return Ok(false);
        };
        let Some(track) = self.catalog.get(track_id) else {
            return Ok(false);
        };
        if track.overflow_location(Some(dump)).is_some() {
            return Ok(false);
        }

        // 작성자가 덤프 채널에 쓸 수 없으면 두 채널을 모두 읽는 다른 세션이 복사한다
        let copier = author
            .filter(|a| a.can_read(dump) && a.is_healthy())
            .or_else(|| {
                self.pool
                    .sessions_reading(track.source.channel_id)
                    .find(|s| s.can_read(dump) && s.is_healthy())
            })
            .cloned()
            .ok_or_else(|| IngestError::NoCopier(track_id.clone()))?;

        let copied = copier.backend().copy_to_channel(&track.source, dump).await?;
        tracing::info!(
            track_id = %track_id,
            session = %copier.id(),
            location = %copied,
            "Track copied to dump channel"
        );
        for slot in self.pool.sessions_reading(dump) {
            self.catalog
                .add_holder(
                    track_id,
                    Holder {
                        session: slot.id().to_string(),
                        location: copied,
                    },
                )
                .await?;
        }
        Ok(true)
    }
}

/// 주기적 수집 태스크
pub fn spawn_ingest(
    feeder: Arc<IngestFeeder>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(MIN_TASK_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Ingest task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    feeder.poll_once().await;
                }
            }
        }
    })
}
