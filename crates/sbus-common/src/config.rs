//! ---
//! sbus_section: "01-core-functionality"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Shared primitives and utilities for the bus node."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

/// Block sizes accepted by the CoAP block-wise transfer (RFC 7959 SZX 0..=6).
pub const COAP_BLOCK_SIZES: [usize; 7] = [16, 32, 64, 128, 256, 512, 1024];

fn default_node_name() -> String {
    "topico/servidor".to_owned()
}

fn default_transport() -> TransportKind {
    TransportKind::Coap
}

fn default_coap_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5683))
}

fn default_coap_path() -> String {
    "servidor".to_owned()
}

fn default_coap_peer() -> String {
    "coap://127.0.0.1:5684/barramento".to_owned()
}

fn default_block_size() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    16 * 1024
}

fn default_ack_timeout() -> Duration {
    Duration::from_millis(2_000)
}

fn default_max_retransmit() -> u32 {
    4
}

fn default_broker_url() -> String {
    "tcp://localhost:1883".to_owned()
}

fn default_client_id() -> String {
    "sbus-node".to_owned()
}

fn default_subscribe_topic() -> String {
    "topico/servidor".to_owned()
}

fn default_publish_topic() -> String {
    "topico/barramento".to_owned()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_channel_capacity() -> usize {
    64
}

fn default_reconnect_attempts() -> usize {
    5
}

fn default_reconnect_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_services_dir() -> PathBuf {
    PathBuf::from("servicos")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("modelos")
}

fn default_market_base_url() -> String {
    "https://www.alphavantage.co/query".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a bus node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub coap: CoapConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub handlers: HandlerConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "SBUS_CONFIG";

    /// Load configuration from disk, respecting the `SBUS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(anyhow!("node.name must not be empty"));
        }
        if self.handlers.timeout.is_zero() {
            return Err(anyhow!("handlers.timeout_secs must be greater than zero"));
        }
        self.coap.validate()?;
        self.mqtt.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Wire transport a node runs on.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Coap,
    Mqtt,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coap" => Ok(TransportKind::Coap),
            "mqtt" => Ok(TransportKind::Mqtt),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Logical address stamped as `origin` on locally produced envelopes.
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            transport: default_transport(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoapConfig {
    #[serde(default = "default_coap_listen")]
    pub listen: SocketAddr,
    /// Resource path the server accepts POSTs on.
    #[serde(default = "default_coap_path")]
    pub path: String,
    /// Default peer URL, `coap://host:port/path`.
    #[serde(default = "default_coap_peer")]
    pub peer: String,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_ack_timeout", rename = "ack_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ack_timeout: Duration,
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit: u32,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            listen: default_coap_listen(),
            path: default_coap_path(),
            peer: default_coap_peer(),
            block_size: default_block_size(),
            max_message_size: default_max_message_size(),
            ack_timeout: default_ack_timeout(),
            max_retransmit: default_max_retransmit(),
        }
    }
}

impl CoapConfig {
    pub fn validate(&self) -> Result<()> {
        if !COAP_BLOCK_SIZES.contains(&self.block_size) {
            return Err(anyhow!(
                "coap.block_size {} must be a power of two between 16 and 1024",
                self.block_size
            ));
        }
        if self.max_message_size < self.block_size {
            return Err(anyhow!(
                "coap.max_message_size {} is smaller than coap.block_size {}",
                self.max_message_size,
                self.block_size
            ));
        }
        if self.path.trim_matches('/').is_empty() {
            return Err(anyhow!("coap.path must not be empty"));
        }
        let peer = if self.peer.contains("://") {
            self.peer.clone()
        } else {
            format!("coap://{}", self.peer)
        };
        Url::parse(&peer).with_context(|| format!("invalid coap.peer {}", self.peer))?;
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_reconnect_base_delay", rename = "base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_reconnect_max_delay", rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay: default_reconnect_base_delay(),
            max_delay: default_reconnect_max_delay(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, `tcp://host:port` or `mqtt://host:port`.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    pub publish_topic: String,
    #[serde(default = "default_keep_alive", rename = "keep_alive_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            subscribe_topic: default_subscribe_topic(),
            publish_topic: default_publish_topic(),
            keep_alive: default_keep_alive(),
            channel_capacity: default_channel_capacity(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(anyhow!("mqtt.client_id must not be empty"));
        }
        if self.subscribe_topic.trim().is_empty() || self.publish_topic.trim().is_empty() {
            return Err(anyhow!("mqtt topics must not be empty"));
        }
        let url = Url::parse(&self.broker_url)
            .with_context(|| format!("invalid mqtt.broker_url {}", self.broker_url))?;
        if url.host_str().is_none() {
            return Err(anyhow!("mqtt.broker_url {} has no host", self.broker_url));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default = "default_handler_timeout", rename = "timeout_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    /// Directory receiving single service files.
    #[serde(default = "default_services_dir")]
    pub services_dir: PathBuf,
    /// Directory receiving extracted service bundles.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            timeout: default_handler_timeout(),
            services_dir: default_services_dir(),
            models_dir: default_models_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "default_market_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl MarketConfig {
    pub const ENV_API_KEY: &'static str = "SBUS_MARKET_API_KEY";

    /// API key from `SBUS_MARKET_API_KEY`, falling back to the configured value.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(Self::ENV_API_KEY)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: default_market_base_url(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
