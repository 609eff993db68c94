use config::{Config, Environment, File};
use proxy_hub_error::HubResult;
use serde::Deserialize;
use std::path::PathBuf;

/// Top-level hub configuration, loaded from a TOML/JSON file merged with
/// `PROXY_HUB__`-prefixed environment variables.
///
/// The config crate lowercases every key it reads, so the field names are
/// snake_case and each carries a lowercased-camelCase alias to keep the
/// original file key spelling working.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub cloud: CloudConfig,
    /// Directory holding the persisted linked-device file.
    #[serde(default = "HubConfig::default_data_dir", alias = "datadir")]
    pub data_dir: PathBuf,
    /// Console/file log level (trace, debug, info, warn, error).
    #[serde(default = "HubConfig::default_log_level", alias = "loglevel")]
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cloud: CloudConfig::default(),
            data_dir: Self::default_data_dir(),
            log_level: Self::default_log_level(),
        }
    }
}

impl HubConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("data")
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load from `path` (optional file) layered with environment overrides.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &str) -> HubResult<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("PROXY_HUB").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// Cloud broker / device API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Broker endpoint for the persistent socket.
    #[serde(default = "CloudConfig::default_web_socket_url", alias = "websocketurl")]
    pub web_socket_url: String,
    /// REST base URL for the device API (create / name / token).
    #[serde(default = "CloudConfig::default_api_url", alias = "apiurl")]
    pub api_url: String,
    /// Idle-stall window: no inbound frame for this long forces a reconnect,
    /// and it doubles as the reconnect delay after an unrequested close.
    #[serde(
        default = "CloudConfig::default_stalled_connection_period_ms",
        alias = "stalledconnectionperiodms"
    )]
    pub stalled_connection_period_ms: u64,
    /// Per-device bound on the deferred telemetry queue; the oldest entry is
    /// dropped when exceeded.
    #[serde(
        default = "CloudConfig::default_max_deferred_messages_per_device",
        alias = "maxdeferredmessagesperdevice"
    )]
    pub max_deferred_messages_per_device: usize,
    /// When false, frames that fail to transmit are dropped instead of
    /// entering the failed queue.
    #[serde(
        default = "CloudConfig::default_retry_on_transmission_error",
        alias = "retryontransmissionerror"
    )]
    pub retry_on_transmission_error: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            web_socket_url: Self::default_web_socket_url(),
            api_url: Self::default_api_url(),
            stalled_connection_period_ms: Self::default_stalled_connection_period_ms(),
            max_deferred_messages_per_device: Self::default_max_deferred_messages_per_device(),
            retry_on_transmission_error: Self::default_retry_on_transmission_error(),
        }
    }
}

impl CloudConfig {
    fn default_web_socket_url() -> String {
        "wss://api.cloud.example/v1.1/websocket?ack=true".to_string()
    }

    fn default_api_url() -> String {
        "https://api.cloud.example/v1.1".to_string()
    }

    fn default_stalled_connection_period_ms() -> u64 {
        35_000
    }

    fn default_max_deferred_messages_per_device() -> usize {
        100
    }

    fn default_retry_on_transmission_error() -> bool {
        true
    }
}
