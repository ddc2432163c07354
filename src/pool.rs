//! 클라이언트 풀
//!
//! 세션(봇 클라이언트)들의 부하 카운터와 헬스 상태를 관리한다.
//! 세션마다 개별 잠금을 쓰므로 풀 전체를 잠그는 경로는 없다.

use crate::backend::{ChannelId, FileLocation, SessionBackend};
use crate::catalog::{SessionId, Track};
use crate::error::{BackendError, StreamError};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct SlotState {
    load: usize,
    healthy: bool,
    consecutive_failures: u32,
    needs_reconnect: bool,
}

/// 풀에 등록된 세션 하나
pub struct SessionSlot {
    id: SessionId,
    scope: HashSet<ChannelId>,
    backend: Arc<dyn SessionBackend>,
    state: Mutex<SlotState>,
}

impl SessionSlot {
    pub fn new(id: impl Into<SessionId>, scope: HashSet<ChannelId>, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            id: id.into(),
            scope,
            backend,
            state: Mutex::new(SlotState {
                load: 0,
                healthy: true,
                consecutive_failures: 0,
                needs_reconnect: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    pub fn can_read(&self, channel_id: ChannelId) -> bool {
        self.scope.contains(&channel_id)
    }

    pub fn load(&self) -> usize {
        self.lock().load
    }

    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // 임계 구역 안에서 패닉할 코드가 없으므로 poison은 무시한다
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 헬스 확인과 부하 증가를 한 번에 처리
    fn try_take(&self) -> bool {
        let mut state = self.lock();
        if !state.healthy {
            return false;
        }
        state.load += 1;
        true
    }

    fn release(&self) {
        let mut state = self.lock();
        state.load = state.load.saturating_sub(1);
    }
}

/// 대여된 세션. drop 시 부하 카운터가 반환된다.
pub struct SessionLease {
    slot: Arc<SessionSlot>,
    location: FileLocation,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.slot.id
    }

    pub fn location(&self) -> &FileLocation {
        &self.location
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.slot.backend
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.slot.id)
            .field("location", &self.location)
            .finish()
    }
}

/// 헬스 상태 요약
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub healthy: usize,
    pub total: usize,
}

impl PoolHealth {
    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total
    }

    pub fn status(&self) -> &'static str {
        // 세션이 하나도 없을 때의 구분은 HTTP 상태(503)가 맡는다
        if self.all_healthy() {
            "ok"
        } else {
            "degraded"
        }
    }
}

/// 세션 풀
pub struct ClientPool {
    slots: Vec<Arc<SessionSlot>>,
    dump_channel: Option<ChannelId>,
    failure_threshold: u32,
}

impl ClientPool {
    pub fn new(
        mut slots: Vec<SessionSlot>,
        dump_channel: Option<ChannelId>,
        failure_threshold: u32,
    ) -> Self {
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            slots: slots.into_iter().map(Arc::new).collect(),
            dump_channel,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn dump_channel(&self) -> Option<ChannelId> {
        self.dump_channel
    }

    pub fn slots(&self) -> &[Arc<SessionSlot>] {
        &self.slots
    }

    pub fn slot(&self, id: &str) -> Option<&Arc<SessionSlot>> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// 해당 채널을 읽을 수 있는 세션들 (ID 순)
    pub fn sessions_reading(&self, channel_id: ChannelId) -> impl Iterator<Item = &Arc<SessionSlot>> {
        self.slots.iter().filter(move |s| s.can_read(channel_id))
    }

    pub fn acquire(&self, track: &Track) -> Result<SessionLease, StreamError> {
        self.acquire_with(track, None, &[])
    }

    /// 트랙을 제공할 수 있는 가장 한가한 세션을 대여한다.
    ///
    /// holder 중 건강한 세션을 우선하고 (부하, ID) 순으로 고른다. 건강한 holder가
    /// 없으면 덤프 채널 복사본을 덤프 채널을 읽을 수 있는 아무 세션으로 제공한다.
    /// `prefer`는 부하와 관계없이 먼저 시도되고, `exclude`는 후보에서 빠진다.
    pub fn acquire_with(
        &self,
        track: &Track,
        prefer: Option<&str>,
        exclude: &[SessionId],
    ) -> Result<SessionLease, StreamError> {
        // 선택과 대여 사이에 세션이 죽을 수 있으므로 몇 번 다시 고른다
        for _ in 0..=self.slots.len() {
            let candidates = self.candidates(track, exclude);
            if candidates.is_empty() {
                break;
            }

            let preferred = prefer.and_then(|p| candidates.iter().find(|(s, _)| s.id == p));
            let picked = preferred.or_else(|| {
                candidates
                    .iter()
                    .min_by(|(a, _), (b, _)| a.load().cmp(&b.load()).then_with(|| a.id.cmp(&b.id)))
            });

            if let Some((slot, location)) = picked {
                if slot.try_take() {
                    tracing::debug!(
                        track_id = %track.id,
                        session = %slot.id,
                        location = %location,
                        "Session acquired"
                    );
                    return Ok(SessionLease {
                        slot: slot.clone(),
                        location: *location,
                    });
                }
            }
        }

        tracing::warn!(track_id = %track.id, "No healthy session can serve track");
        Err(StreamError::NoHealthySession)
    }

    fn candidates(&self, track: &Track, exclude: &[SessionId]) -> Vec<(Arc<SessionSlot>, FileLocation)> {
        let usable = |slot: &SessionSlot| slot.is_healthy() && !exclude.contains(&slot.id);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for holder in &track.holders {
            if !seen.insert(holder.session.as_str()) {
                continue;
            }
            if let Some(slot) = self.slot(&holder.session) {
                if usable(slot) {
                    out.push((slot.clone(), holder.location));
                }
            }
        }
        if !out.is_empty() {
            return out;
        }

        if let Some(location) = track.overflow_location(self.dump_channel) {
            out.extend(
                self.sessions_reading(location.channel_id)
                    .filter(|s| usable(s))
                    .map(|s| (s.clone(), location)),
            );
        }
        out
    }

    /// 명시적 반환 (보통은 lease drop으로 처리된다)
    pub fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    /// 프로브가 회복을 확인할 때까지 선택 대상에서 제외
    pub fn mark_unhealthy(&self, session: &str) {
        if let Some(slot) = self.slot(session) {
            let mut state = slot.lock();
            if state.healthy {
                tracing::warn!(session = %session, "Session marked unhealthy");
            }
            state.healthy = false;
            state.consecutive_failures = state.consecutive_failures.max(self.failure_threshold);
        }
    }

    /// 프로브 결과 반영: 연속 실패가 임계치에 닿으면 비정상, 한 번 성공하면 회복
    pub fn record_probe(&self, session: &str, result: &Result<(), BackendError>) {
        let Some(slot) = self.slot(session) else {
            return;
        };
        let mut state = slot.lock();
        match result {
            Ok(()) => {
                if !state.healthy {
                    tracing::info!(session = %session, "Session recovered");
                }
                state.healthy = true;
                state.consecutive_failures = 0;
                state.needs_reconnect = false;
            }
            Err(e) => {
                state.consecutive_failures += 1;
                if matches!(e, BackendError::Unauthorized) {
                    state.needs_reconnect = true;
                }
                if state.healthy && state.consecutive_failures >= self.failure_threshold {
                    state.healthy = false;
                    tracing::warn!(
                        session = %session,
                        failures = state.consecutive_failures,
                        error = %e,
                        "Session marked unhealthy after failed probes"
                    );
                } else {
                    tracing::debug!(session = %session, error = %e, "Session probe failed");
                }
            }
        }
    }

    /// 전체 세션 프로브 (동시 실행)
    pub async fn probe_all(&self) -> PoolHealth {
        let probes = self.slots.iter().map(|slot| async move {
            let needs_reconnect = slot.lock().needs_reconnect;
            if needs_reconnect {
                tracing::info!(session = %slot.id, "Reconnecting session");
                if let Err(e) = slot.backend.reconnect().await {
                    tracing::warn!(session = %slot.id, error = %e, "Reconnect failed");
                }
            }
            let result = slot.backend.probe().await;
            self.record_probe(&slot.id, &result);
        });
        futures::future::join_all(probes).await;
        self.health()
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth {
            healthy: self.slots.iter().filter(|s| s.is_healthy()).count(),
            total: self.slots.len(),
        }
    }
}

/// 주기 태스크의 최소 간격. tokio interval은 0을 허용하지 않는다.
pub const MIN_TASK_INTERVAL: Duration = Duration::from_millis(1);

/// 주기적인 세션 헬스 프로브
pub fn spawn_health_probe(
    pool: Arc<ClientPool>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(MIN_TASK_INTERVAL);
    tokio::spawn(async move {
        // 여러 인스턴스가 동시에 프로브하지 않도록 시작 시점을 흩뜨린다
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval + jitter, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Health probe task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let health = pool.probe_all().await;
                    if !health.all_healthy() {
                        tracing::warn!(healthy = health.healthy, total = health.total, "Session pool degraded");
                    }
                }
            }
        }
    })
}
