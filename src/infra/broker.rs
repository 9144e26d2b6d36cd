//! In-process MQTT broker (rumqttd) for running against `mock-feed` locally

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Feed payloads are small JSON objects
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// rumqttd settings for a single v4 listener on `listen`
fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 10 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 64,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let listener = ServerSettings {
        name: "presence-v4".to_string(),
        listen,
        tls: None,
        next_connection_delay_ms: 1,
        connections: ConnectionSettings {
            connection_timeout_ms: 5000,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_inflight_count: 100,
            auth: None,
            dynamic_filters: false,
            external_auth: None,
        },
    };

    Config {
        id: 0,
        router,
        v4: Some(HashMap::from([("v4".to_string(), listener)])),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker if `[broker] enabled = true`.
///
/// A bad bind address or a failed start is logged; the gateway keeps running
/// and the transport retries against whatever broker is configured.
pub fn start_embedded_broker(app_config: &AppConfig) {
    if !app_config.broker_enabled() {
        return;
    }

    if let Err(e) = spawn_broker(app_config.broker_bind_address(), app_config.broker_port()) {
        warn!(error = %format!("{e:#}"), "broker_start_failed");
    }
}

fn spawn_broker(bind_address: &str, port: u16) -> anyhow::Result<()> {
    let listen: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .with_context(|| format!("invalid broker bind address {bind_address}:{port}"))?;
    let config = broker_config(listen);

    // start() blocks for the life of the broker
    thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_stopped");
            }
        })
        .context("failed to spawn broker thread")?;

    // Let the listener bind before the transport dials it
    thread::sleep(Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    Ok(())
}
