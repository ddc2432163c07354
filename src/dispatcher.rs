//! 스트림 디스패처
//!
//! 트랙 ID + Range 요청을 받아 세션을 대여하고, 요청된 바이트 구간을 청크 단위로
//! 흘려보낸다. 세션이 중간에 실패하면 아직 보내지 않은 구간을 다른 holder에서
//! 한 번 더 시도한다.

use crate::catalog::{SessionId, Track, TrackLocator};
use crate::error::{BackendError, StreamError};
use crate::pool::{ClientPool, SessionLease};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

/// 스트림당 허용되는 페일오버 횟수
const MAX_FAILOVERS: u32 = 1;

/// 포함 구간 `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePlan {
    Full,
    Partial(ByteRange),
}

/// Range 헤더 해석.
///
/// 헤더가 없거나 형식이 잘못되었거나 다중 구간이면 전체 응답으로 처리한다.
/// 시작 위치가 파일 길이 이상이면 416.
pub fn parse_range(header: Option<&str>, total: u64) -> Result<RangePlan, StreamError> {
    let Some(raw) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(RangePlan::Full);
    };
    let Some(spec) = raw
        .get(..6)
        .filter(|p| p.eq_ignore_ascii_case("bytes="))
        .map(|_| raw[6..].trim())
    else {
        return Ok(RangePlan::Full);
    };
    if spec.contains(',') {
        return Ok(RangePlan::Full);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(RangePlan::Full);
    };
    let (start, end) = (start.trim(), end.trim());

    // bytes=-N (마지막 N바이트)
    if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return Ok(RangePlan::Full);
        };
        if suffix == 0 || total == 0 {
            return Err(StreamError::RangeUnsatisfiable { total });
        }
        return Ok(RangePlan::Partial(ByteRange {
            start: total.saturating_sub(suffix),
            end: total - 1,
        }));
    }

    let Ok(start) = start.parse::<u64>() else {
        return Ok(RangePlan::Full);
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(e) if e >= start => Some(e),
            _ => return Ok(RangePlan::Full),
        }
    };

    if start >= total {
        return Err(StreamError::RangeUnsatisfiable { total });
    }
    let last = total - 1;
    Ok(RangePlan::Partial(ByteRange {
        start,
        end: end.map_or(last, |e| e.min(last)),
    }))
}

/// 스트리밍 응답 (상태, 헤더, 바이트 스트림)
pub struct StreamResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub content_length: u64,
    pub content_range: Option<String>,
    pub body: ReceiverStream<Result<Bytes, std::io::Error>>,
}

impl IntoResponse for StreamResponse {
    fn into_response(self) -> Response {
        let mut builder = Response::builder()
            .status(self.status)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_TYPE, self.content_type)
            .header(header::CONTENT_LENGTH, self.content_length);
        if let Some(range) = self.content_range {
            builder = builder.header(header::CONTENT_RANGE, range);
        }
        match builder.body(Body::from_stream(self.body)) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build stream response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// 스트림 디스패처
pub struct StreamDispatcher {
    catalog: Arc<TrackLocator>,
    pool: Arc<ClientPool>,
    chunk_size: u64,
    buffer_chunks: usize,
}

impl StreamDispatcher {
    pub fn new(
        catalog: Arc<TrackLocator>,
        pool: Arc<ClientPool>,
        chunk_size: u64,
        buffer_chunks: usize,
    ) -> Self {
        Self {
            catalog,
            pool,
            chunk_size: chunk_size.max(1),
            buffer_chunks: buffer_chunks.max(1),
        }
    }

    /// 트랙의 요청 구간을 스트리밍한다.
    ///
    /// 첫 청크는 응답 전에 가져오므로 전송 시작 전의 실패는 503으로 드러난다.
    /// 이후의 실패는 바디 스트림 에러로 전달된다.
    pub async fn serve(&self, track_id: &str, range: Option<&str>) -> Result<StreamResponse, StreamError> {
        let track = self.catalog.get(track_id).ok_or(StreamError::TrackNotFound)?;
        let total = track.size;
        let plan = parse_range(range, total)?;

        let (status, window, content_range) = match plan {
            RangePlan::Full => (StatusCode::OK, (0, total), None),
            RangePlan::Partial(r) => (
                StatusCode::PARTIAL_CONTENT,
                (r.start, r.end + 1),
                Some(format!("bytes {}-{}/{}", r.start, r.end, total)),
            ),
        };

        tracing::debug!(
            track_id = %track.id,
            range = ?range,
            start = window.0,
            end = window.1,
            "Stream requested"
        );

        let content_type = track.mime_type.clone();
        let mut pump = Pump {
            pool: self.pool.clone(),
            track,
            offset: window.0,
            end: window.1,
            chunk_size: self.chunk_size,
            lease: None,
            last_session: None,
            failed: Vec::new(),
            failovers: 0,
        };
        let first = pump.next_chunk().await?;

        let (tx, rx) = mpsc::channel(self.buffer_chunks);
        tokio::spawn(pump.run(tx, first));

        Ok(StreamResponse {
            status,
            content_type,
            content_length: window.1 - window.0,
            content_range,
            body: ReceiverStream::new(rx),
        })
    }
}

/// 스트림 하나의 바이트 펌프
struct Pump {
    pool: Arc<ClientPool>,
    track: Track,
    offset: u64,
    end: u64,
    chunk_size: u64,
    lease: Option<SessionLease>,
    last_session: Option<SessionId>,
    failed: Vec<SessionId>,
    failovers: u32,
}

impl Pump {
    async fn run(mut self, tx: mpsc::Sender<Result<Bytes, std::io::Error>>, first: Option<Bytes>) {
        let mut pending = first;
        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => {
                    let next = tokio::select! {
                        _ = tx.closed() => {
                            tracing::debug!(track_id = %self.track.id, offset = self.offset, "Client disconnected");
                            return;
                        }
                        next = self.next_chunk() => next,
                    };
                    match next {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            self.lease = None;
                            tracing::error!(track_id = %self.track.id, offset = self.offset, error = %e, "Stream aborted");
                            let _ = tx
                                .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                                .await;
                            return;
                        }
                    }
                }
            };

            // 소비자가 밀려 있으면 기다리는 동안 세션을 풀에 돌려준다
            let permit = match tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    self.lease = None;
                    match tx.reserve().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::debug!(track_id = %self.track.id, "Client disconnected while stalled");
                            return;
                        }
                    }
                }
                Err(TrySendError::Closed(())) => return,
            };
            permit.send(Ok(chunk));
        }

        // 수신 측이 끝을 보기 전에 세션을 반환
        self.lease = None;
        tracing::debug!(track_id = %self.track.id, "Stream completed");
    }

    /// 다음 청크. 구간 끝이면 None.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            if self.offset >= self.end {
                return Ok(None);
            }

            let lease = match self.lease.take() {
                Some(lease) => lease,
                None => {
                    let lease =
                        self.pool
                            .acquire_with(&self.track, self.last_session.as_deref(), &self.failed)?;
                    self.last_session = Some(lease.session_id().to_string());
                    lease
                }
            };

            let want = self.chunk_size.min(self.end - self.offset);
            let error = match lease
                .backend()
                .fetch_chunk(lease.location(), self.offset, want)
                .await
            {
                Ok(mut bytes) if !bytes.is_empty() => {
                    bytes.truncate(want as usize);
                    self.offset += bytes.len() as u64;
                    self.lease = Some(lease);
                    return Ok(Some(bytes));
                }
                Ok(_) => BackendError::Truncated {
                    offset: self.offset,
                },
                Err(e) => e,
            };

            let session = lease.session_id().to_string();
            drop(lease);
            tracing::warn!(
                track_id = %self.track.id,
                session = %session,
                offset = self.offset,
                error = %error,
                "Session fetch failed"
            );

            // 위치나 파일 문제는 세션 헬스를 건드리지 않는다
            if !matches!(
                error,
                BackendError::NotFound { .. }
                    | BackendError::Forbidden(_)
                    | BackendError::Truncated { .. }
            ) {
                self.pool.mark_unhealthy(&session);
            }
            self.failed.push(session);
            self.last_session = None;

            if self.failovers >= MAX_FAILOVERS {
                return Err(StreamError::SessionFetchFailed(error));
            }
            self.failovers += 1;
            tracing::info!(track_id = %self.track.id, offset = self.offset, "Failing over to alternate holder");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryChannels};
    use crate::backend::FileLocation;
    use crate::catalog::{Holder, MemoryStore, NewTrack};
    use crate::pool::SessionSlot;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    const SRC: i64 = 100;

    struct Fixture {
        dispatcher: StreamDispatcher,
        pool: Arc<ClientPool>,
        a: Arc<MemoryBackend>,
        b: Arc<MemoryBackend>,
        track_id: String,
        data: Vec<u8>,
    }

    async fn fixture(chunk_size: u64, buffer_chunks: usize) -> Fixture {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let source = FileLocation::new(SRC, 1);
        let channels = MemoryChannels::new();
        channels.put(source, data.clone(), "audio/mpeg");

        let a = Arc::new(MemoryBackend::new(channels.clone(), &[SRC]));
        let b = Arc::new(MemoryBackend::new(channels, &[SRC]));
        let pool = Arc::new(ClientPool::new(
            vec![
                SessionSlot::new("A", [SRC].into(), a.clone()),
                SessionSlot::new("B", [SRC].into(), b.clone()),
            ],
            None,
            3,
        ));

        let catalog = Arc::new(TrackLocator::load(Arc::new(MemoryStore::new())).await.unwrap());
        let mut track_id = String::new();
        for session in ["A", "B"] {
            let (id, _) = catalog
                .register(NewTrack {
                    source,
                    holder: Holder {
                        session: session.into(),
                        location: source,
                    },
                    size: data.len() as u64,
                    duration_sec: Some(10.0),
                    mime_type: Some("audio/mpeg".into()),
                    title: None,
                    performer: None,
                })
                .await
                .unwrap();
            track_id = id;
        }

        Fixture {
            dispatcher: StreamDispatcher::new(catalog, pool.clone(), chunk_size, buffer_chunks),
            pool,
            a,
            b,
            track_id,
            data,
        }
    }

    async fn collect(response: StreamResponse) -> (Vec<u8>, Option<std::io::Error>) {
        let mut body = response.body;
        let mut out = Vec::new();
        while let Some(item) = body.next().await {
            match item {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    async fn wait_for_idle(pool: &ClientPool) {
        for _ in 0..100 {
            if pool.slots().iter().all(|s| s.load() == 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions were not released");
    }

    #[test]
    fn test_parse_range() {
        let total = 10_000;
        assert_eq!(parse_range(None, total).unwrap(), RangePlan::Full);
        assert_eq!(
            parse_range(Some("bytes=4000-"), total).unwrap(),
            RangePlan::Partial(ByteRange { start: 4000, end: 9999 })
        );
        assert_eq!(
            parse_range(Some("Bytes=0-99"), total).unwrap(),
            RangePlan::Partial(ByteRange { start: 0, end: 99 })
        );
        assert_eq!(
            parse_range(Some("bytes=9000-20000"), total).unwrap(),
            RangePlan::Partial(ByteRange { start: 9000, end: 9999 })
        );
        assert_eq!(
            parse_range(Some("bytes=-500"), total).unwrap(),
            RangePlan::Partial(ByteRange { start: 9500, end: 9999 })
        );
        assert_eq!(parse_range(Some("bytes=5-1"), total).unwrap(), RangePlan::Full);
        assert_eq!(parse_range(Some("bytes=0-1,5-6"), total).unwrap(), RangePlan::Full);
        assert_eq!(parse_range(Some("items=0-1"), total).unwrap(), RangePlan::Full);
        assert!(matches!(
            parse_range(Some("bytes=10000-"), total),
            Err(StreamError::RangeUnsatisfiable { total: 10_000 })
        ));
        assert!(matches!(
            parse_range(Some("bytes=0-"), 0),
            Err(StreamError::RangeUnsatisfiable { total: 0 })
        ));
    }

    #[tokio::test]
    async fn test_full_content() {
        let f = fixture(1024, 2).await;
        let response = f.dispatcher.serve(&f.track_id, None).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_length, 10_000);
        assert!(response.content_range.is_none());

        let (bytes, err) = collect(response).await;
        assert!(err.is_none());
        assert_eq!(bytes, f.data);
        wait_for_idle(&f.pool).await;
    }

    #[tokio::test]
    async fn test_range_is_exact_and_idempotent() {
        let f = fixture(333, 2).await;
        let first = f.dispatcher.serve(&f.track_id, Some("bytes=1234-5678")).await.unwrap();
        assert_eq!(first.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(first.content_range.as_deref(), Some("bytes 1234-5678/10000"));
        assert_eq!(first.content_length, 4445);
        let (one, _) = collect(first).await;

        let second = f.dispatcher.serve(&f.track_id, Some("bytes=1234-5678")).await.unwrap();
        let (two, _) = collect(second).await;

        assert_eq!(one, &f.data[1234..=5678]);
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_failover_resumes_at_next_unsent_byte() {
        let f = fixture(1000, 2).await;
        f.a.fail_from(4500);

        let response = f.dispatcher.serve(&f.track_id, Some("bytes=4000-")).await.unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.content_range.as_deref(), Some("bytes 4000-9999/10000"));
        assert_eq!(response.content_length, 6000);

        let (bytes, err) = collect(response).await;
        assert!(err.is_none());
        assert_eq!(bytes.len(), 6000);
        assert_eq!(bytes, &f.data[4000..]);

        assert!(!f.pool.slot("A").unwrap().is_healthy());
        assert!(f.b.fetches.load(std::sync::atomic::Ordering::SeqCst) > 0);
        wait_for_idle(&f.pool).await;
    }

    #[tokio::test]
    async fn test_failure_before_first_byte_is_unavailable() {
        let f = fixture(1000, 2).await;
        f.a.fail_from(0);
        f.b.fail_from(0);

        let result = f.dispatcher.serve(&f.track_id, Some("bytes=0-99")).await;
        assert!(matches!(result, Err(StreamError::SessionFetchFailed(_))));
        wait_for_idle(&f.pool).await;
    }

    #[tokio::test]
    async fn test_second_failure_aborts_stream_without_duplicates() {
        let f = fixture(1000, 2).await;
        f.a.fail_from(5000);
        f.b.fail_from(6000);

        let response = f.dispatcher.serve(&f.track_id, Some("bytes=4000-")).await.unwrap();
        let (bytes, err) = collect(response).await;
        assert!(err.is_some());
        assert_eq!(bytes, &f.data[4000..6000]);
        wait_for_idle(&f.pool).await;
    }

    #[tokio::test]
    async fn test_unknown_track_and_bad_range() {
        let f = fixture(1000, 2).await;
        assert!(matches!(
            f.dispatcher.serve("missing", None).await,
            Err(StreamError::TrackNotFound)
        ));
        assert!(matches!(
            f.dispatcher.serve(&f.track_id, Some("bytes=10001-")).await,
            Err(StreamError::RangeUnsatisfiable { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_healthy_session() {
        let f = fixture(1000, 2).await;
        f.pool.mark_unhealthy("A");
        f.pool.mark_unhealthy("B");
        assert!(matches!(
            f.dispatcher.serve(&f.track_id, None).await,
            Err(StreamError::NoHealthySession)
        ));
    }

    #[tokio::test]
    async fn test_short_file_keeps_sessions_healthy() {
        let source = FileLocation::new(SRC, 7);
        let channels = MemoryChannels::new();
        channels.put(source, vec![9u8; 5_000], "audio/mpeg");
        let a = Arc::new(MemoryBackend::new(channels.clone(), &[SRC]));
        let b = Arc::new(MemoryBackend::new(channels, &[SRC]));
        let pool = Arc::new(ClientPool::new(
            vec![
                SessionSlot::new("A", [SRC].into(), a),
                SessionSlot::new("B", [SRC].into(), b),
            ],
            None,
            3,
        ));
        let catalog = Arc::new(TrackLocator::load(Arc::new(MemoryStore::new())).await.unwrap());
        let mut track_id = String::new();
        for session in ["A", "B"] {
            let (id, _) = catalog
                .register(NewTrack {
                    source,
                    holder: Holder {
                        session: session.into(),
                        location: source,
                    },
                    // 기록된 크기가 실제 파일보다 크다
                    size: 6_000,
                    duration_sec: None,
                    mime_type: Some("audio/mpeg".into()),
                    title: None,
                    performer: None,
                })
                .await
                .unwrap();
            track_id = id;
        }
        let dispatcher = StreamDispatcher::new(catalog, pool.clone(), 1024, 2);

        let response = dispatcher.serve(&track_id, None).await.unwrap();
        assert_eq!(response.content_length, 6_000);
        let (body, error) = collect(response).await;
        assert_eq!(body.len(), 5_000);
        assert!(error.is_some());

        wait_for_idle(&pool).await;
        let health = pool.health();
        assert_eq!(health.healthy, 2);
        assert_eq!(health.status(), "ok");
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_session() {
        let f = fixture(100, 1).await;
        let response = f.dispatcher.serve(&f.track_id, None).await.unwrap();
        let mut body = response.body;
        assert!(body.next().await.is_some());
        drop(body);
        wait_for_idle(&f.pool).await;
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_others() {
        let f = fixture(100, 1).await;

        let stalled = f.dispatcher.serve(&f.track_id, None).await.unwrap();
        // 소비하지 않는 동안 세션이 풀에 반환된다
        wait_for_idle(&f.pool).await;

        let other = f.dispatcher.serve(&f.track_id, Some("bytes=0-2999")).await.unwrap();
        let (bytes, _) = tokio::time::timeout(Duration::from_secs(5), collect(other))
            .await
            .unwrap();
        assert_eq!(bytes, &f.data[..3000]);

        let (rest, err) = collect(stalled).await;
        assert!(err.is_none());
        assert_eq!(rest, f.data);
    }
}
