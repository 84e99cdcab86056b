//! Runtime configuration: defaults, then environment, then CLI flags.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2048;
pub const DEFAULT_MODEL_NAME: &str = "chat-relay";
pub const CHAT_COMPLETION_ID_PREFIX: &str = "chatcmpl-";

/// Where streamed response text comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Records pushed into the in-process stream queue by an interceptor.
    AuxStream,
    /// The automation layer's own page scrape.
    Page,
}

impl FromStr for ResponseSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "aux-stream" | "aux" | "stream" => Ok(Self::AuxStream),
            "page" | "scrape" => Ok(Self::Page),
            other => Err(format!("unknown response source: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Base bound on producing one response.
    pub response_timeout: Duration,
    /// Added to `response_timeout` for the worker's completion wait.
    pub completion_slack: Duration,
    /// Added to `response_timeout` for the HTTP handler's wait.
    pub handler_slack: Duration,
    pub min_stream_interval: Duration,
    pub maintenance_batch: usize,
    pub liveness_interval: Duration,
    pub dequeue_timeout: Duration,
    pub response_source: ResponseSource,
    pub stream_idle_timeout: Duration,
    pub pseudo_stream_delay: Duration,
    pub model_name: String,
    pub catalog_ttl: Duration,
    pub excluded_models_path: Option<PathBuf>,
    pub token: Option<String>,
    /// One key per line; managed through `/api/keys`.
    pub api_key_file: Option<PathBuf>,
    pub driver_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            response_timeout: Duration::from_millis(300_000),
            completion_slack: Duration::from_secs(60),
            handler_slack: Duration::from_secs(120),
            min_stream_interval: Duration::from_millis(1_000),
            maintenance_batch: 10,
            liveness_interval: Duration::from_millis(300),
            dequeue_timeout: Duration::from_secs(5),
            response_source: ResponseSource::AuxStream,
            stream_idle_timeout: Duration::from_millis(30_000),
            pseudo_stream_delay: Duration::from_millis(30),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            catalog_ttl: Duration::from_secs(300),
            excluded_models_path: None,
            token: None,
            api_key_file: None,
            driver_url: None,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` on top of the defaults. Values that do
    /// not parse are reported and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = lookup("CHAT_RELAY_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "CHAT_RELAY_PORT") {
            config.port = port;
        }
        if let Some(ms) = parse(&lookup, "CHAT_RELAY_RESPONSE_TIMEOUT_MS") {
            config.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CHAT_RELAY_MIN_STREAM_INTERVAL_MS") {
            config.min_stream_interval = Duration::from_millis(ms);
        }
        if let Some(batch) = parse(&lookup, "CHAT_RELAY_MAINTENANCE_BATCH") {
            config.maintenance_batch = batch;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "CHAT_RELAY_LIVENESS_INTERVAL_MS") {
            config.liveness_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(source) = parse(&lookup, "CHAT_RELAY_RESPONSE_SOURCE") {
            config.response_source = source;
        }
        if let Some(ms) = parse(&lookup, "CHAT_RELAY_STREAM_IDLE_TIMEOUT_MS") {
            config.stream_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "CHAT_RELAY_PSEUDO_STREAM_DELAY_MS") {
            config.pseudo_stream_delay = Duration::from_millis(ms);
        }
        if let Some(name) = lookup("CHAT_RELAY_MODEL_NAME") {
            config.model_name = name;
        }
        if let Some(secs) = parse(&lookup, "CHAT_RELAY_MODEL_CATALOG_TTL_SECS") {
            config.catalog_ttl = Duration::from_secs(secs);
        }
        if let Some(path) = lookup("CHAT_RELAY_EXCLUDED_MODELS") {
            config.excluded_models_path = Some(PathBuf::from(path));
        }
        if let Some(token) = lookup("CHAT_RELAY_TOKEN") {
            config.token = Some(token);
        }
        if let Some(path) = lookup("CHAT_RELAY_API_KEY_FILE") {
            config.api_key_file = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("CHAT_RELAY_DRIVER_URL") {
            config.driver_url = Some(url);
        }
        config
    }

    pub fn completion_wait(&self) -> Duration {
        self.response_timeout + self.completion_slack
    }

    pub fn handler_wait(&self) -> Duration {
        self.response_timeout + self.handler_slack
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, value = %raw, error = %err, "ignoring invalid configuration value");
            None
        }
    }
}
