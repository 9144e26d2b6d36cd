//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::SiteId;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site selected at startup
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Alerts arrive on `<prefix>/alert`, occupancy on `<prefix>/live_occupancy`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Session token, sent as the MQTT password
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Consecutive failed connection attempts before giving up (0 = never)
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Broadcast buffer per subscriber
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_topic_prefix() -> String {
    "analytics".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_channel_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Cached pages younger than this are served without refetching
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Background refetch of the first page (0 to disable)
    #[serde(default = "default_refetch_interval_secs")]
    pub refetch_interval_secs: u64,
    /// Gender lookup cache lifetime
    #[serde(default = "default_demographics_stale_after_ms")]
    pub demographics_stale_after_ms: u64,
    /// Upper bound on cached pages; the oldest fetch is evicted first
    #[serde(default = "default_max_cached_pages")]
    pub max_cached_pages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            stale_after_ms: default_stale_after_ms(),
            refetch_interval_secs: default_refetch_interval_secs(),
            demographics_stale_after_ms: default_demographics_stale_after_ms(),
            max_cached_pages: default_max_cached_pages(),
        }
    }
}

fn default_page_size() -> u32 {
    25
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_max_cached_pages() -> usize {
    64
}

fn default_refetch_interval_secs() -> u64 {
    60
}

fn default_demographics_stale_after_ms() -> u64 {
    5 * 60 * 1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// HTTP port for /metrics, /presence and /live (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, http_port: default_http_port() }
    }
}

fn default_http_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an in-process MQTT broker for local development
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub transport: TransportConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: SiteId,
    site_name: Option<String>,
    transport_host: String,
    transport_port: u16,
    transport_topic_prefix: String,
    transport_username: Option<String>,
    transport_token: Option<String>,
    reconnect_delay_ms: u64,
    reconnect_attempts: u32,
    channel_capacity: usize,
    api_base_url: String,
    api_token: Option<String>,
    api_timeout_ms: u64,
    history_page_size: u32,
    history_stale_after_ms: u64,
    history_refetch_interval_secs: u64,
    demographics_stale_after_ms: u64,
    history_max_cached_pages: usize,
    metrics_interval_secs: u64,
    http_port: u16,
    config_file: String,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: SiteId::from("default"),
            site_name: None,
            transport_host: "localhost".to_string(),
            transport_port: 1883,
            transport_topic_prefix: default_topic_prefix(),
            transport_username: None,
            transport_token: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            channel_capacity: default_channel_capacity(),
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            api_timeout_ms: default_api_timeout_ms(),
            history_page_size: default_page_size(),
            history_stale_after_ms: default_stale_after_ms(),
            history_refetch_interval_secs: default_refetch_interval_secs(),
            demographics_stale_after_ms: default_demographics_stale_after_ms(),
            history_max_cached_pages: default_max_cached_pages(),
            metrics_interval_secs: 10,
            http_port: default_http_port(),
            config_file: "default".to_string(),
            broker_enabled: false,
            broker_bind_address: default_broker_bind_address(),
            broker_port: default_broker_port(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if toml_config.site.id.is_empty() {
            anyhow::bail!("site.id must not be empty in {}", path.display());
        }

        Ok(Self {
            site_id: SiteId(toml_config.site.id),
            site_name: toml_config.site.name,
            transport_host: toml_config.transport.host,
            transport_port: toml_config.transport.port,
            transport_topic_prefix: toml_config.transport.topic_prefix,
            transport_username: toml_config.transport.username,
            transport_token: toml_config.transport.token,
            reconnect_delay_ms: toml_config.transport.reconnect_delay_ms,
            reconnect_attempts: toml_config.transport.reconnect_attempts,
            channel_capacity: toml_config.transport.channel_capacity.max(1),
            api_base_url: toml_config.api.base_url.trim_end_matches('/').to_string(),
            api_token: toml_config.api.token,
            api_timeout_ms: toml_config.api.timeout_ms,
            history_page_size: toml_config.history.page_size.max(1),
            history_stale_after_ms: toml_config.history.stale_after_ms,
            history_refetch_interval_secs: toml_config.history.refetch_interval_secs,
            demographics_stale_after_ms: toml_config.history.demographics_stale_after_ms,
            history_max_cached_pages: toml_config.history.max_cached_pages.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            http_port: toml_config.metrics.http_port,
            config_file: path.display().to_string(),
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
        })
    }

    /// Load configuration from a path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Topic carrying entry/exit alerts
    pub fn alert_topic(&self) -> String {
        format!("{}/alert", self.transport_topic_prefix)
    }

    /// Topic carrying occupancy updates
    pub fn live_occupancy_topic(&self) -> String {
        format!("{}/live_occupancy", self.transport_topic_prefix)
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    pub fn site_name(&self) -> Option<&str> {
        self.site_name.as_deref()
    }

    pub fn transport_host(&self) -> &str {
        &self.transport_host
    }

    pub fn transport_port(&self) -> u16 {
        self.transport_port
    }

    pub fn transport_topic_prefix(&self) -> &str {
        &self.transport_topic_prefix
    }

    pub fn transport_username(&self) -> Option<&str> {
        self.transport_username.as_deref()
    }

    pub fn transport_token(&self) -> Option<&str> {
        self.transport_token.as_deref()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn history_page_size(&self) -> u32 {
        self.history_page_size
    }

    pub fn history_stale_after(&self) -> Duration {
        Duration::from_millis(self.history_stale_after_ms)
    }

    pub fn history_refetch_interval_secs(&self) -> u64 {
        self.history_refetch_interval_secs
    }

    pub fn history_max_cached_pages(&self) -> usize {
        self.history_max_cached_pages
    }

    pub fn demographics_stale_after(&self) -> Duration {
        Duration::from_millis(self.demographics_stale_after_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport_host(), "localhost");
        assert_eq!(config.transport_port(), 1883);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));
        assert_eq!(config.reconnect_attempts(), 5);
        assert_eq!(config.history_page_size(), 25);
        assert_eq!(config.history_stale_after(), Duration::from_secs(30));
        assert_eq!(config.history_refetch_interval_secs(), 60);
        assert_eq!(config.history_max_cached_pages(), 64);
        assert!(!config.broker_enabled());
    }

    #[test]
    fn test_topics_from_prefix() {
        let config = Config::default();
        assert_eq!(config.alert_topic(), "analytics/alert");
        assert_eq!(config.live_occupancy_topic(), "analytics/live_occupancy");
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["presence-gateway".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "presence-gateway".to_string(),
            "--config".to_string(),
            "config/mall.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/mall.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["presence-gateway".to_string(), "--config=config/arena.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/arena.toml");
    }

    #[test]
    fn test_history_config_default() {
        let history = HistoryConfig::default();
        assert_eq!(history.page_size, 25);
        assert_eq!(history.demographics_stale_after_ms, 300_000);
    }
}
