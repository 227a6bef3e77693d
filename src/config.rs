//! Environment configuration with the `BALEEN_` prefix.
//!
//! Every key is optional and falls back to its documented default, e.g.
//! `BALEEN_FEED_SYNC_INTERVAL=30m` or `BALEEN_LOG_LEVEL=debug`. Durations
//! accept humantime strings (`30s`, `1h`). A `.env` file in the working
//! directory is loaded first, so local development does not need to export
//! anything.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not process configuration from the environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: feed sync interval must be 1s or greater")]
    IntervalTooShort,

    #[error("invalid configuration: unknown log level {0:?}")]
    UnknownLogLevel(String),

    #[error("invalid configuration: no publisher or subscriber enabled")]
    NoBroker,

    #[error(
        "invalid configuration: remote broker endpoints are not supported, \
         leave the endpoint empty to use the in-process broker"
    )]
    UnsupportedBroker,
}

/// Service configuration loaded from `BALEEN_`-prefixed environment
/// variables. All fields use `#[serde(default)]` so any subset of keys can
/// be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging threshold: trace, debug, info, warn, or error.
    pub log_level: String,

    /// Use the human-readable console writer instead of JSON logs.
    pub console_log: bool,

    /// How long the router waits for in-flight handlers on shutdown.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,

    /// Enable the feed synchronization handler.
    pub feed_sync_enabled: bool,

    /// Tick interval of the background sync loop (1s or greater).
    #[serde(with = "humantime_serde")]
    pub feed_sync_interval: Duration,

    /// Enable the post fetch handler.
    pub post_fetch_enabled: bool,

    /// Handler retries before a message is nacked; zero defers redelivery
    /// to the broker.
    pub max_retries: u32,

    /// Enable the Prometheus metrics server.
    pub monitoring_enabled: bool,

    /// Metrics listen address; a bare `:port` binds all interfaces.
    pub monitoring_bind_addr: String,

    /// Publisher side of the broker connection.
    pub publisher_enabled: bool,
    pub publisher_endpoint: String,
    pub publisher_client_id: String,
    pub publisher_client_secret: String,
    pub publisher_insecure: bool,

    /// Subscriber side of the broker connection.
    pub subscriber_enabled: bool,
    pub subscriber_endpoint: String,
    pub subscriber_client_id: String,
    pub subscriber_client_secret: String,
    pub subscriber_insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            console_log: false,
            close_timeout: Duration::from_secs(30),
            feed_sync_enabled: false,
            feed_sync_interval: Duration::from_secs(3600),
            post_fetch_enabled: false,
            max_retries: 0,
            monitoring_enabled: true,
            monitoring_bind_addr: ":1205".to_string(),
            publisher_enabled: true,
            publisher_endpoint: String::new(),
            publisher_client_id: String::new(),
            publisher_client_secret: String::new(),
            publisher_insecure: false,
            subscriber_enabled: true,
            subscriber_endpoint: String::new(),
            subscriber_client_id: String::new(),
            subscriber_client_secret: String::new(),
            subscriber_insecure: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Loads and validates the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] when a variable cannot be parsed into
    /// its field, or any [`validate`](Config::validate) error.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let conf: Config = envy::prefixed("BALEEN_").from_env()?;
        conf.validate()?;
        Ok(conf)
    }

    /// Fails startup on configuration the service cannot run with.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnknownLogLevel`] - `log_level` outside the
    ///   trace/debug/info/warn/error set
    /// - [`ConfigError::IntervalTooShort`] - feed sync enabled with an
    ///   interval under one second
    /// - [`ConfigError::NoBroker`] - a handler enabled without both
    ///   publisher and subscriber
    /// - [`ConfigError::UnsupportedBroker`] - a remote broker endpoint is
    ///   configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::UnknownLogLevel(self.log_level.clone()));
        }

        if self.feed_sync_enabled && self.feed_sync_interval < Duration::from_secs(1) {
            return Err(ConfigError::IntervalTooShort);
        }

        if (self.feed_sync_enabled || self.post_fetch_enabled)
            && !(self.publisher_enabled && self.subscriber_enabled)
        {
            return Err(ConfigError::NoBroker);
        }

        if !self.publisher_endpoint.is_empty() || !self.subscriber_endpoint.is_empty() {
            return Err(ConfigError::UnsupportedBroker);
        }

        Ok(())
    }

    /// The metrics listen address with a bare `:port` expanded to all
    /// interfaces.
    pub fn monitoring_addr(&self) -> String {
        if self.monitoring_bind_addr.starts_with(':') {
            format!("0.0.0.0{}", self.monitoring_bind_addr)
        } else {
            self.monitoring_bind_addr.clone()
        }
    }
}
