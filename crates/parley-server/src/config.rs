//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{
    APP_NAME, DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT, DEFAULT_OUTBOUND_QUEUE,
    DEFAULT_TYPING_TIMEOUT_MS, MAX_HISTORY_LIMIT, MAX_MESSAGE_LEN,
};
use parley_shared::moderation::KeywordFilter;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API and the `/ws` endpoint.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None` (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Env: `TYPING_TIMEOUT_MS`
    pub typing_timeout: Duration,

    /// Page size used when a history request does not carry one.
    /// Env: `HISTORY_PAGE_LIMIT`
    pub history_page_limit: u32,

    /// Env: `MAX_MESSAGE_LEN`
    pub max_message_len: usize,

    /// Per-connection outbound event queue depth. A full queue counts as an
    /// unreachable recipient.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,

    /// Comma-separated keyword list, `word` or `word:severity`.
    /// Env: `MODERATION_KEYWORDS`
    /// Default: empty (moderation hook disabled).
    pub moderation_keywords: Option<String>,

    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            instance_name: APP_NAME.to_string(),
            admin_token: None,
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            history_page_limit: DEFAULT_HISTORY_LIMIT,
            max_message_len: MAX_MESSAGE_LEN,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            moderation_keywords: None,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            if let Some(parsed) = parse_or_warn::<SocketAddr>("HTTP_ADDR", &addr) {
                config.http_addr = parsed;
            }
        }

        if let Some(path) = get("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(name) = get("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = get("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = get("TYPING_TIMEOUT_MS") {
            if let Some(ms) = parse_or_warn::<u64>("TYPING_TIMEOUT_MS", &val).filter(|ms| *ms > 0) {
                config.typing_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(val) = get("HISTORY_PAGE_LIMIT") {
            if let Some(n) = parse_or_warn::<u32>("HISTORY_PAGE_LIMIT", &val) {
                config.history_page_limit = n.clamp(1, MAX_HISTORY_LIMIT);
            }
        }

        if let Some(val) = get("MAX_MESSAGE_LEN") {
            if let Some(n) = parse_or_warn::<usize>("MAX_MESSAGE_LEN", &val).filter(|n| *n > 0) {
                config.max_message_len = n;
            }
        }

        if let Some(val) = get("OUTBOUND_QUEUE") {
            if let Some(n) = parse_or_warn::<usize>("OUTBOUND_QUEUE", &val).filter(|n| *n > 0) {
                config.outbound_queue = n;
            }
        }

        if let Some(list) = get("MODERATION_KEYWORDS") {
            if !list.trim().is_empty() {
                config.moderation_keywords = Some(list);
            }
        }

        if let Some(val) = get("RATE_LIMIT_PER_SEC") {
            if let Some(rate) = parse_or_warn::<f64>("RATE_LIMIT_PER_SEC", &val).filter(|r| *r > 0.0) {
                config.rate_limit_per_sec = rate;
            }
        }

        if let Some(val) = get("RATE_LIMIT_BURST") {
            if let Some(burst) = parse_or_warn::<f64>("RATE_LIMIT_BURST", &val).filter(|b| *b >= 1.0) {
                config.rate_limit_burst = burst;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// The keyword filter for the moderation hook, if one is configured.
    pub fn keyword_filter(&self) -> Option<KeywordFilter> {
        self.moderation_keywords
            .as_deref()
            .map(KeywordFilter::from_list)
            .filter(|f| !f.is_empty())
    }
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid configuration value, using default");
            None
        }
    }
}
