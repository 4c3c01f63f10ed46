//! Configuration inputs (§6 "Environment / configuration inputs").
//!
//! Every field documented in the spec has a `Default` matching the
//! documented default. `Config::from_env()` is the convenience path used by
//! the demo binary and by tests; a host embedding the core is expected to
//! build a [`Config`] programmatically most of the time.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::message::TransportKind;

/// Relative scoring weights for the selection algorithm (§4.5 step 3).
/// Normalized to sum to 1.0 at scoring time — see [`crate::selection`].
#[derive(Debug, Clone, Copy)]
pub struct SelectionWeights {
    pub latency: f64,
    pub reliability: f64,
    pub capability: f64,
    pub cost: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            latency: 0.3,
            reliability: 0.4,
            capability: 0.2,
            cost: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub enable_sse: bool,
    pub max_connections: usize,
    pub health_path: String,
    pub selection_path: String,
    pub preferences_path: String,
    pub chat_path: String,
    pub chat_stream_path: String,
    pub workflow_path: String,
    pub task_planning_path: String,
    pub events_path: String,
    pub probe_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enable_sse: true,
            max_connections: 8,
            health_path: "/status".to_string(),
            selection_path: "/api/obsidian/models/select".to_string(),
            preferences_path: "/api/obsidian/preferences".to_string(),
            chat_path: "/api/obsidian/chat".to_string(),
            chat_stream_path: "/api/obsidian/chat/stream".to_string(),
            workflow_path: "/api/obsidian/workflow".to_string(),
            task_planning_path: "/api/obsidian/planning/tasks".to_string(),
            events_path: "/api/obsidian/events".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub path: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub persist_messages: bool,
    pub persist_queue_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/ws/obsidian".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            persist_messages: false,
            persist_queue_size: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSystemConfig {
    pub root: PathBuf,
    pub watch_interval: Duration,
    pub lock_timeout: Duration,
    pub max_queue_size: usize,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./devpipe"),
            watch_interval: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(5),
            max_queue_size: 100,
        }
    }
}

/// Top-level configuration consumed by [`crate::manager::TransportManager`]
/// and [`crate::selection::ModelSelectionService`] (§6).
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub monitoring_interval: Duration,
    pub cache_duration: Duration,
    pub retry_attempts: usize,
    pub timeout: Duration,
    pub debug_mode: bool,
    pub selection_weights: SelectionWeights,
    pub fallback_chain: Vec<TransportKind>,
    pub auto_failover: bool,
    pub http: HttpConfig,
    pub websocket: WebSocketConfig,
    pub filesystem: FileSystemConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            monitoring_interval: Duration::from_millis(30_000),
            cache_duration: Duration::from_millis(300_000),
            retry_attempts: 3,
            timeout: Duration::from_millis(30_000),
            debug_mode: false,
            selection_weights: SelectionWeights::default(),
            fallback_chain: vec![
                TransportKind::WebSocket,
                TransportKind::Http,
                TransportKind::FileSystem,
            ],
            auto_failover: true,
            http: HttpConfig::default(),
            websocket: WebSocketConfig::default(),
            filesystem: FileSystemConfig::default(),
        }
    }
}

impl Config {
    /// Builds a [`Config`] from environment variables, falling back to the
    /// documented default for anything absent or unparsable. Mirrors the
    /// shape of the teacher's model-registry `from_env`, but here there is a
    /// single coherent record rather than a per-provider map.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.server_url = env::var("TRANSPORT_SERVER_URL").ok();
        config.api_key = env::var("TRANSPORT_API_KEY").ok();

        if let Ok(path) = env::var("TRANSPORT_DEVPIPE_PATH") {
            config.filesystem.root = PathBuf::from(path);
        } else {
            tracing::debug!("TRANSPORT_DEVPIPE_PATH not set — using default devpipe root");
        }

        if let Some(v) = read_millis("TRANSPORT_MONITORING_INTERVAL_MS") {
            config.monitoring_interval = Duration::from_millis(v);
        }
        if let Some(v) = read_millis("TRANSPORT_CACHE_DURATION_MS") {
            config.cache_duration = Duration::from_millis(v);
        }
        if let Some(v) = read_usize("TRANSPORT_RETRY_ATTEMPTS") {
            config.retry_attempts = v;
        }
        if let Some(v) = read_millis("TRANSPORT_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(v);
        }
        config.debug_mode = env::var("TRANSPORT_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        config.auto_failover = env::var("TRANSPORT_AUTO_FAILOVER")
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
            .unwrap_or(true);

        if let Some(v) = read_usize("TRANSPORT_WS_MAX_RECONNECT_ATTEMPTS") {
            config.websocket.max_reconnect_attempts = v as u32;
        }
        config.websocket.persist_messages = env::var("TRANSPORT_WS_PERSIST_MESSAGES")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Some(v) = read_usize("TRANSPORT_FS_MAX_QUEUE_SIZE") {
            config.filesystem.max_queue_size = v;
        }

        if config.server_url.is_none() {
            tracing::warn!("TRANSPORT_SERVER_URL not set — HTTP/WebSocket transports will fail to connect");
        }

        config
    }
}

fn read_millis(key: &str) -> Option<u64> {
    read_env_parsed(key)
}

fn read_usize(key: &str) -> Option<usize> {
    read_env_parsed(key)
}

fn read_env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("{key} set but not parsable ({raw:?}) — using default");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.monitoring_interval, Duration::from_secs(30));
        assert_eq!(config.cache_duration, Duration::from_secs(300));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(!config.debug_mode);
        assert!(config.auto_failover);
        assert_eq!(
            config.fallback_chain,
            vec![
                TransportKind::WebSocket,
                TransportKind::Http,
                TransportKind::FileSystem
            ]
        );
    }

    #[test]
    fn selection_weights_default_matches_spec() {
        let w = SelectionWeights::default();
        assert_eq!((w.latency, w.reliability, w.capability, w.cost), (0.3, 0.4, 0.2, 0.1));
    }
}
