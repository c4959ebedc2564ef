//! Chat client configuration parsed from environment variables.

use std::time::Duration;

use frames::HeartBeat;

use crate::error::ChatError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_BROKER_URL: &str = "ws://localhost:8080/ws/websocket";
pub const DEFAULT_HISTORY_PATH: &str = "/api/chat/history/{productId}";
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic/chat/room/";
pub const DEFAULT_APP_DESTINATION: &str = "/app/chat/message";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 12;
pub const DEFAULT_HEARTBEAT_MS: u64 = 4000;
pub const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Backoff schedule for broker reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): doubles from the base
    /// delay up to the ceiling.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << shift)
            .min(self.max_delay)
    }

    /// True once `attempt` exceeds the cap.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            max_attempts: Some(DEFAULT_RECONNECT_MAX_ATTEMPTS),
        }
    }
}

/// Broker connection settings shared by every room connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    pub topic_prefix: String,
    pub app_destination: String,
    pub heart_beat: HeartBeat,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    /// Topic carrying every message of one room.
    #[must_use]
    pub fn room_topic(&self, chat_room_id: i64) -> String {
        format!("{}{chat_room_id}", self.topic_prefix)
    }

    /// `host` header value for the STOMP handshake.
    #[must_use]
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        rest.split(['/', '?']).next().unwrap_or(rest)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_owned(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
            app_destination: DEFAULT_APP_DESTINATION.to_owned(),
            heart_beat: HeartBeat::new(DEFAULT_HEARTBEAT_MS, DEFAULT_HEARTBEAT_MS),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub api_base_url: String,
    /// History endpoint path; `{productId}` is substituted.
    pub history_path: String,
    pub request_timeout: Duration,
    /// `None` keeps unconfirmed sends pending forever.
    pub pending_timeout: Option<Duration>,
    pub broker: BrokerConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            history_path: DEFAULT_HISTORY_PATH.to_owned(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            pending_timeout: Some(Duration::from_secs(DEFAULT_PENDING_TIMEOUT_SECS)),
            broker: BrokerConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Build typed chat config from environment variables.
    ///
    /// Optional:
    /// - `CHAT_API_BASE_URL`: REST base, default `http://localhost:8080`
    /// - `CHAT_BROKER_URL`: STOMP websocket endpoint, default `ws://localhost:8080/ws/websocket`
    /// - `CHAT_HISTORY_PATH`: default `/api/chat/history/{productId}`
    /// - `CHAT_TOPIC_PREFIX`: default `/topic/chat/room/`
    /// - `CHAT_APP_DESTINATION`: default `/app/chat/message`
    /// - `CHAT_RECONNECT_DELAY_MS`: default 5000
    /// - `CHAT_RECONNECT_MAX_DELAY_MS`: default 30000
    /// - `CHAT_RECONNECT_MAX_ATTEMPTS`: default 12, `0` retries forever
    /// - `CHAT_HEARTBEAT_OUTGOING_MS` / `CHAT_HEARTBEAT_INCOMING_MS`: default 4000
    /// - `CHAT_PENDING_TIMEOUT_SECS`: default 15, `0` never fails a send
    /// - `CHAT_REQUEST_TIMEOUT_SECS`: default 10
    /// - `CHAT_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::ConfigParse`] when a URL has the wrong scheme.
    pub fn from_env() -> Result<Self, ChatError> {
        let api_base_url = env_string("CHAT_API_BASE_URL", DEFAULT_API_BASE_URL);
        let broker_url = env_string("CHAT_BROKER_URL", DEFAULT_BROKER_URL);

        let max_attempts = env_parse("CHAT_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS);
        let pending_secs = env_parse("CHAT_PENDING_TIMEOUT_SECS", DEFAULT_PENDING_TIMEOUT_SECS);

        let config = Self {
            api_base_url,
            history_path: env_string("CHAT_HISTORY_PATH", DEFAULT_HISTORY_PATH),
            request_timeout: Duration::from_secs(env_parse("CHAT_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)),
            pending_timeout: (pending_secs > 0).then(|| Duration::from_secs(pending_secs)),
            broker: BrokerConfig {
                url: broker_url,
                topic_prefix: env_string("CHAT_TOPIC_PREFIX", DEFAULT_TOPIC_PREFIX),
                app_destination: env_string("CHAT_APP_DESTINATION", DEFAULT_APP_DESTINATION),
                heart_beat: HeartBeat::new(
                    env_parse("CHAT_HEARTBEAT_OUTGOING_MS", DEFAULT_HEARTBEAT_MS),
                    env_parse("CHAT_HEARTBEAT_INCOMING_MS", DEFAULT_HEARTBEAT_MS),
                ),
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(env_parse("CHAT_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)),
                    max_delay: Duration::from_millis(env_parse(
                        "CHAT_RECONNECT_MAX_DELAY_MS",
                        DEFAULT_RECONNECT_MAX_DELAY_MS,
                    )),
                    max_attempts: (max_attempts > 0).then_some(max_attempts),
                },
                connect_timeout: Duration::from_secs(env_parse("CHAT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check URL schemes.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::ConfigParse`] naming the offending value.
    pub fn validate(&self) -> Result<(), ChatError> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(ChatError::ConfigParse(format!(
                "CHAT_API_BASE_URL must be http(s)://, got '{}'",
                self.api_base_url
            )));
        }
        if !(self.broker.url.starts_with("ws://") || self.broker.url.starts_with("wss://")) {
            return Err(ChatError::ConfigParse(format!(
                "CHAT_BROKER_URL must be ws(s)://, got '{}'",
                self.broker.url
            )));
        }
        Ok(())
    }

    /// Absolute URL of the history endpoint for one product.
    #[must_use]
    pub fn history_url(&self, product_id: i64) -> String {
        let path = self.history_path.replace("{productId}", &product_id.to_string());
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    /// Absolute URL for any other REST path.
    #[must_use]
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
