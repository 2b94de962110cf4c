use std::time::Duration;

use crate::errors::StreamError;
use crate::retry::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY, RetryPolicy};

/// Connection and retry settings for the streaming client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the generation service.
    pub base_url: String,
    /// Path of the streaming endpoint, joined onto `base_url`.
    pub stream_path: String,
    /// Path of the health endpoint.
    pub health_path: String,
    /// Optional bearer token sent with every request.
    pub auth_token: Option<String>,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Maximum silence between body chunks before the attempt is treated as
    /// a dropped connection. `None` waits indefinitely.
    pub idle_timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

impl ClientConfig {
    /// Creates a config with defaults for the given service URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_path: "/api/complete/stream".to_string(),
            health_path: "/api/complete/health".to_string(),
            auth_token: None,
            user_agent: concat!("chat-stream/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }

    /// Builds a config from `CHAT_STREAM_*` environment variables.
    ///
    /// - `CHAT_STREAM_BASE_URL` (default `http://localhost:8000`)
    /// - `CHAT_STREAM_AUTH_TOKEN`
    /// - `CHAT_STREAM_MAX_RETRIES`
    /// - `CHAT_STREAM_RETRY_BASE_MS`
    /// - `CHAT_STREAM_IDLE_TIMEOUT_SECS`
    /// - `CHAT_STREAM_CONNECT_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StreamError> {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut config = match read("CHAT_STREAM_BASE_URL") {
            Some(url) => Self::new(url.trim()),
            None => Self::default(),
        };
        if let Some(token) = read("CHAT_STREAM_AUTH_TOKEN") {
            config.auth_token = Some(token.trim().to_string());
        }
        if let Some(raw) = read("CHAT_STREAM_MAX_RETRIES") {
            config.max_retries = parse_number("CHAT_STREAM_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = read("CHAT_STREAM_RETRY_BASE_MS") {
            config.retry_base_delay =
                Duration::from_millis(parse_number("CHAT_STREAM_RETRY_BASE_MS", &raw)?);
        }
        if let Some(raw) = read("CHAT_STREAM_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Some(Duration::from_secs(parse_number(
                "CHAT_STREAM_IDLE_TIMEOUT_SECS",
                &raw,
            )?));
        }
        if let Some(raw) = read("CHAT_STREAM_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(parse_number(
                "CHAT_STREAM_CONNECT_TIMEOUT_SECS",
                &raw,
            )?);
        }
        Ok(config)
    }

    /// Overrides the service base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the streaming endpoint path.
    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    /// Sets a bearer token.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables the idle-read timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay)
    }

    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(StreamError::Config("base_url must not be empty".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(StreamError::Config(format!(
                "base_url must be an http(s) URL, got {base}"
            )));
        }
        if self.max_retries == 0 {
            return Err(StreamError::Config(
                "max_retries must allow at least one attempt".into(),
            ));
        }
        Ok(())
    }

    pub fn stream_url(&self) -> String {
        join_url(&self.base_url, &self.stream_path)
    }

    pub fn health_url(&self) -> String {
        join_url(&self.base_url, &self.health_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        path.trim().trim_start_matches('/')
    )
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, StreamError> {
    raw.trim()
        .parse()
        .map_err(|_| StreamError::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}
