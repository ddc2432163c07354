//! 환경 변수 기반 설정 관리

use crate::backend::ChannelId;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
    pub sessions: Vec<SessionConfig>,
    pub channels: ChannelConfig,
    pub storage_root: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub stream: StreamConfig,
    pub health: HealthConfig,
    pub ingest_interval: Duration,
    pub room: RoomConfig,
    pub log_level: String,
}

/// 세션(봇 클라이언트) 자격 증명
#[derive(Clone)]
pub struct SessionConfig {
    pub id: String,
    pub token: String,
    pub channels: HashSet<ChannelId>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("id", &self.id)
            .field("token", &"***")
            .field("channels", &self.channels)
            .finish()
    }
}

/// 채널 설정
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub sources: Vec<ChannelId>,
    pub dump: Option<ChannelId>,
    pub multi_clients: bool,
}

/// 스트리밍 설정
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub chunk_size: u64,
    pub buffer_chunks: usize,
}

/// 세션 헬스 프로브 설정
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub failure_threshold: u32,
}

/// 방 설정
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_size: usize,
    pub grace: Duration,
    pub reap_interval: Duration,
}

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// 주기 설정(초). 0은 1초로 올린다.
fn interval_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(var_or(key, default).max(1))
}

fn channel_list(raw: &str) -> Vec<ChannelId> {
    raw.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let sessions = env::var("SESSION_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|id| {
                let key = id.to_uppercase();
                SessionConfig {
                    id: id.to_string(),
                    token: env::var(format!("SESSION_{}_TOKEN", key)).unwrap_or_default(),
                    channels: channel_list(
                        &env::var(format!("SESSION_{}_CHANNELS", key)).unwrap_or_default(),
                    )
                    .into_iter()
                    .collect(),
                }
            })
            .collect();

        Self {
            port: var_or("PORT", 8080),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            sessions,
            channels: ChannelConfig {
                sources: channel_list(&env::var("SOURCE_CHANNEL_IDS").unwrap_or_default()),
                dump: Some(var_or::<ChannelId>("DUMP_CHANNEL_ID", 0)).filter(|id| *id != 0),
                multi_clients: env::var("MULTI_CLIENTS")
                    .map(|v| v != "false")
                    .unwrap_or(true),
            },
            storage_root: env::var("STORAGE_ROOT")
                .unwrap_or_else(|_| "./data/channels".to_string())
                .into(),
            catalog_path: env::var("CATALOG_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            stream: StreamConfig {
                chunk_size: var_or("STREAM_CHUNK_SIZE", 1024 * 1024u64).max(1),
                buffer_chunks: var_or("STREAM_BUFFER_CHUNKS", 2usize).max(1),
            },
            health: HealthConfig {
                probe_interval: interval_secs("HEALTH_PROBE_INTERVAL_SECS", 30),
                failure_threshold: var_or("HEALTH_FAILURE_THRESHOLD", 3),
            },
            ingest_interval: interval_secs("INGEST_POLL_INTERVAL_SECS", 15),
            room: RoomConfig {
                max_size: var_or("MAX_ROOM_SIZE", 50),
                grace: Duration::from_secs(var_or("ROOM_GRACE_SECS", 60)),
                reap_interval: interval_secs("ROOM_REAP_INTERVAL_SECS", 10),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_list_ignores_garbage() {
        assert_eq!(channel_list("100, -200,abc,,300"), vec![100, -200, 300]);
        assert!(channel_list("").is_empty());
    }

    #[test]
    fn test_zero_interval_is_raised_to_one_second() {
        std::env::set_var("CHANSTREAM_TEST_ZERO_INTERVAL", "0");
        assert_eq!(
            interval_secs("CHANSTREAM_TEST_ZERO_INTERVAL", 30),
            Duration::from_secs(1)
        );
        assert_eq!(
            interval_secs("CHANSTREAM_TEST_UNSET_INTERVAL", 30),
            Duration::from_secs(30)
        );
    }
}
