//! Push-event transport over MQTT
//!
//! `EventTransport` owns the broker connection. Nothing is global: the daemon
//! creates one, calls `connect()`, hands `subscribe()` receivers to whoever
//! needs events, and calls `disconnect()` on shutdown.
//!
//! Payloads are validated here. Subscribers only ever see `TransportEvent`;
//! anything that fails validation is logged, counted, and dropped.

use crate::domain::types::{
    AlertMessage, LiveOccupancyEvent, LiveOccupancyMessage, MalformedEvent, TransportEvent,
    VisitEvent,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ALERT_CHANNEL: &str = "alert";
const LIVE_OCCUPANCY_CHANNEL: &str = "live_occupancy";

/// A registered event handler. Dropping it deregisters the handler.
pub type Subscription = broadcast::Receiver<TransportEvent>;

/// Parse one broker message into a typed event.
///
/// `topic` must be `<prefix>/alert` or `<prefix>/live_occupancy`.
pub fn parse_message(
    topic: &str,
    prefix: &str,
    payload: &[u8],
) -> Result<TransportEvent, MalformedEvent> {
    let channel = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| MalformedEvent::UnknownChannel(topic.to_string()))?;

    let json = std::str::from_utf8(payload).map_err(|_| MalformedEvent::InvalidUtf8)?;

    match channel {
        ALERT_CHANNEL => {
            let msg: AlertMessage = serde_json::from_str(json)
                .map_err(|e| MalformedEvent::InvalidJson(e.to_string()))?;
            Ok(TransportEvent::Alert(VisitEvent::try_from(msg)?))
        }
        LIVE_OCCUPANCY_CHANNEL => {
            let msg: LiveOccupancyMessage = serde_json::from_str(json)
                .map_err(|e| MalformedEvent::InvalidJson(e.to_string()))?;
            Ok(TransportEvent::LiveOccupancy(LiveOccupancyEvent::try_from(msg)?))
        }
        other => Err(MalformedEvent::UnknownChannel(other.to_string())),
    }
}

/// Live connection state, present between `connect()` and `disconnect()`
struct Connection {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Reconnect policy and subscription list handed to the event loop task
#[derive(Clone)]
struct LoopSettings {
    topics: [String; 2],
    prefix: String,
    reconnect_delay: Duration,
    /// 0 retries forever
    reconnect_attempts: u32,
}

/// Explicitly owned push-event connection
pub struct EventTransport {
    client_id: String,
    host: String,
    port: u16,
    username: Option<String>,
    token: Option<String>,
    settings: LoopSettings,
    events_tx: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    connection: Mutex<Option<Connection>>,
    metrics: Arc<Metrics>,
}

impl EventTransport {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        let (events_tx, _) = broadcast::channel(config.channel_capacity());
        Self {
            client_id: format!("presence-gateway-{}", std::process::id()),
            host: config.transport_host().to_string(),
            port: config.transport_port(),
            username: config.transport_username().map(str::to_string),
            token: config.transport_token().map(str::to_string),
            settings: LoopSettings {
                topics: [config.alert_topic(), config.live_occupancy_topic()],
                prefix: config.transport_topic_prefix().to_string(),
                reconnect_delay: config.reconnect_delay(),
                reconnect_attempts: config.reconnect_attempts(),
            },
            events_tx,
            connected: Arc::new(AtomicBool::new(false)),
            connection: Mutex::new(None),
            metrics,
        }
    }

    /// Register a new event handler
    pub fn subscribe(&self) -> Subscription {
        self.events_tx.subscribe()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events_tx.receiver_count()
    }

    /// True while the broker session is up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Open the broker session and start delivering events.
    ///
    /// Must be called from within a tokio runtime. Calling it while a session
    /// is live is a no-op. A session whose event loop gave up after
    /// `reconnect_attempts` failures is replaced. Returns true when a new
    /// session was started.
    pub fn connect(&self) -> bool {
        let mut guard = self.connection.lock();
        if let Some(conn) = guard.as_ref() {
            if !conn.task.is_finished() {
                debug!("transport_already_connected");
                return false;
            }
            info!("transport_restarting_stopped_session");
        }

        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some(token) = &self.token {
            let username = self.username.as_deref().unwrap_or("token");
            options.set_credentials(username, token);
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            self.settings.clone(),
            self.events_tx.clone(),
            self.connected.clone(),
            self.metrics.clone(),
            shutdown_rx,
        ));

        info!(host = %self.host, port = %self.port, prefix = %self.settings.prefix, "transport_connecting");
        *guard = Some(Connection { client, shutdown_tx, task });
        true
    }

    /// Close the broker session. Existing subscriptions stay registered but
    /// receive nothing until the next `connect()`.
    pub async fn disconnect(&self) {
        let Some(conn) = self.connection.lock().take() else {
            return;
        };

        let _ = conn.client.try_disconnect();
        let _ = conn.shutdown_tx.send(true);
        if let Err(e) = conn.task.await {
            warn!(error = %e, "transport_task_join_failed");
        }
        self.connected.store(false, Ordering::Relaxed);
        info!("transport_disconnected");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    settings: LoopSettings,
    events_tx: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;
    // Rate-limit malformed warnings to 1 per second
    let mut last_malformed_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        consecutive_failures = 0;
                        connected.store(true, Ordering::Relaxed);
                        metrics.record_transport_connect();
                        // Clean sessions forget subscriptions across reconnects
                        for topic in &settings.topics {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!(topic = %topic, error = %e, "transport_subscribe_failed");
                            }
                        }
                        info!(topics = ?settings.topics, "transport_connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match parse_message(&publish.topic, &settings.prefix, &publish.payload) {
                            Ok(event) => {
                                // No subscribers is not an error, the event is simply unobserved
                                if events_tx.send(event).is_err() {
                                    debug!(topic = %publish.topic, "transport_event_unobserved");
                                }
                            }
                            Err(e) => {
                                metrics.record_malformed(matches!(e, MalformedEvent::UnknownDirection(_)));
                                if last_malformed_warn.elapsed() > Duration::from_secs(1) {
                                    warn!(topic = %publish.topic, kind = e.kind(), error = %e, "malformed_event_dropped");
                                    last_malformed_warn = Instant::now();
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::Relaxed);
                        info!("transport_broker_disconnect");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::Relaxed);
                        consecutive_failures += 1;
                        warn!(error = %e, attempt = consecutive_failures, "transport_connection_error");

                        if settings.reconnect_attempts > 0
                            && consecutive_failures >= settings.reconnect_attempts
                        {
                            error!(attempts = consecutive_failures, "transport_reconnect_exhausted");
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(settings.reconnect_delay) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
}
