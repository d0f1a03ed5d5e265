use std::time::Duration;

use crate::error::ConfigError;
use crate::gateway::events::ConnectionProperties;
use crate::gateway::intents;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub gateway_url: String,
    pub api_version: u8,
    pub compress: bool,
    pub intents: u64,
    pub cache_size: usize,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnects: Option<u32>,
    pub protocol_error_threshold: u32,
    /// Upper bound of the random pause before identifying again after an
    /// invalidated session. The lower bound is a fifth of it.
    pub invalid_session_delay: Duration,
    pub properties: ConnectionProperties,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            api_version: 9,
            compress: true,
            intents: intents::standard(),
            cache_size: 1500,
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnects: None,
            protocol_error_threshold: 5,
            invalid_session_delay: Duration::from_secs(5),
            properties: ConnectionProperties::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// Read `BHAICORD_*` variables. Unset or unparsable values fall back to
    /// the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let intents = match std::env::var("BHAICORD_INTENTS") {
            Ok(value) => intents::parse(&value).unwrap_or_else(|e| {
                tracing::warn!("ignoring BHAICORD_INTENTS: {e}");
                defaults.intents
            }),
            Err(_) => defaults.intents,
        };

        Self {
            token: std::env::var("BHAICORD_TOKEN").unwrap_or_default(),
            gateway_url: std::env::var("BHAICORD_GATEWAY_URL")
                .unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string()),
            api_version: env_parse("BHAICORD_API_VERSION").unwrap_or(defaults.api_version),
            compress: std::env::var("BHAICORD_COMPRESS")
                .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
                .unwrap_or(defaults.compress),
            intents,
            cache_size: env_parse("BHAICORD_CACHE_SIZE").unwrap_or(defaults.cache_size),
            connect_timeout: env_parse("BHAICORD_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            reconnect_delay: env_parse("BHAICORD_RECONNECT_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            reconnect_max_delay: env_parse("BHAICORD_RECONNECT_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_max_delay),
            max_reconnects: env_parse("BHAICORD_MAX_RECONNECTS"),
            protocol_error_threshold: env_parse("BHAICORD_PROTOCOL_ERROR_THRESHOLD")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.protocol_error_threshold),
            invalid_session_delay: defaults.invalid_session_delay,
            properties: defaults.properties,
        }
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reconnect backoff starts at `base` and doubles up to `max`.
    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_delay = base;
        self.reconnect_max_delay = max.max(base);
        self
    }

    pub fn with_max_reconnects(mut self, limit: Option<u32>) -> Self {
        self.max_reconnects = limit;
        self
    }

    pub fn with_invalid_session_delay(mut self, delay: Duration) -> Self {
        self.invalid_session_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.cache_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        Ok(())
    }

    /// Full connection URL for `base` with version, encoding and
    /// compression query parameters.
    pub fn endpoint(&self, base: &str) -> String {
        let mut url = format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            self.api_version
        );
        if self.compress {
            url.push_str("&compress=zlib-stream");
        }
        url
    }
}
