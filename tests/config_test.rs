//! Integration tests for configuration loading

use presence_gateway::domain::types::SiteId;
use presence_gateway::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"
name = "Test Site"

[transport]
host = "test-host"
port = 1884
topic_prefix = "crowd"
token = "secret"
reconnect_delay_ms = 250
reconnect_attempts = 3

[api]
base_url = "https://api.example.test/"
token = "bearer"
timeout_ms = 3000

[history]
page_size = 50
stale_after_ms = 10000
refetch_interval_secs = 15
max_cached_pages = 0

[metrics]
interval_secs = 15
http_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), &SiteId::from("test-site"));
    assert_eq!(config.site_name(), Some("Test Site"));
    assert_eq!(config.transport_host(), "test-host");
    assert_eq!(config.transport_port(), 1884);
    assert_eq!(config.transport_token(), Some("secret"));
    assert_eq!(config.alert_topic(), "crowd/alert");
    assert_eq!(config.live_occupancy_topic(), "crowd/live_occupancy");
    assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    assert_eq!(config.reconnect_attempts(), 3);
    assert_eq!(config.api_base_url(), "https://api.example.test");
    assert_eq!(config.api_timeout(), Duration::from_millis(3000));
    assert_eq!(config.history_page_size(), 50);
    assert_eq!(config.history_stale_after(), Duration::from_secs(10));
    assert_eq!(config.history_refetch_interval_secs(), 15);
    // A zero cap would drop every page on insert
    assert_eq!(config.history_max_cached_pages(), 1);
    assert_eq!(config.http_port(), 9091);
    assert!(!config.broker_enabled());
}

#[test]
fn test_optional_sections_use_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "S1"

[transport]
host = "localhost"
port = 1883

[api]
base_url = "http://localhost:8080"
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.alert_topic(), "analytics/alert");
    assert_eq!(config.reconnect_delay(), Duration::from_millis(1000));
    assert_eq!(config.reconnect_attempts(), 5);
    assert_eq!(config.history_page_size(), 25);
    assert_eq!(config.history_stale_after(), Duration::from_secs(30));
    assert_eq!(config.demographics_stale_after(), Duration::from_secs(300));
    assert_eq!(config.history_max_cached_pages(), 64);
    assert_eq!(config.http_port(), 9090);
}

#[test]
fn test_empty_site_id_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = ""

[transport]
host = "localhost"
port = 1883

[api]
base_url = "http://localhost:8080"
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.transport_host(), "localhost");
    assert_eq!(config.transport_port(), 1883);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_resolve_config_path_from_args() {
    let args = vec!["presence-gateway".to_string(), "--config".to_string(), "site.toml".to_string()];
    assert_eq!(Config::resolve_config_path(&args), "site.toml");

    let args = vec!["presence-gateway".to_string(), "--config=other.toml".to_string()];
    assert_eq!(Config::resolve_config_path(&args), "other.toml");
}
