//! Presence gateway - live visitor presence for one site
//!
//! Subscribes to the analytics push feed, folds entry/exit alerts into a
//! presence map for the active site, and keeps the visit-history cache
//! coherent with what the feed reports.
//!
//! Module structure:
//! - `domain/` - Events, presence records, history pages
//! - `io/` - External interfaces (MQTT transport, analytics API, HTTP)
//! - `services/` - Reconciler, live counters, history cache
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::Parser;
use presence_gateway::infra::{Config, Metrics};
use presence_gateway::io::{AnalyticsClient, AnalyticsSource, EventTransport, HttpState};
use presence_gateway::services::{
    create_invalidation_channel, HistoryCache, HistoryPoller, LiveCounters, PresenceReconciler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Presence gateway - live visitor presence reconciliation
#[derive(Parser, Debug)]
#[command(name = "presence-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Default: INFO, use RUST_LOG=debug for per-alert visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "presence-gateway starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    presence_gateway::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        site_name = config.site_name().unwrap_or("-"),
        transport_host = %config.transport_host(),
        transport_port = %config.transport_port(),
        topic_prefix = %config.transport_topic_prefix(),
        api_base_url = %config.api_base_url(),
        page_size = %config.history_page_size(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Staleness signals: reconciler and counters -> history cache
    let (invalidations, invalidation_rx) = create_invalidation_channel(1024, metrics.clone());

    let source: Arc<dyn AnalyticsSource> =
        Arc::new(AnalyticsClient::new(&config).context("Failed to build analytics client")?);
    let history = Arc::new(HistoryCache::new(
        source.clone(),
        config.history_stale_after(),
        config.demographics_stale_after(),
        metrics.clone(),
    )
    .with_max_pages(config.history_max_cached_pages()));
    {
        let history = history.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            history.run_invalidations(invalidation_rx, shutdown).await;
        });
    }

    // Subscribe before connecting so nothing from the first session is missed
    let transport = Arc::new(EventTransport::new(&config, metrics.clone()));
    let reconciler_sub = transport.subscribe();
    let counters_sub = transport.subscribe();
    transport.connect();

    let (site_tx, site_rx) = watch::channel(config.site_id().clone());
    let site_tx = Arc::new(site_tx);

    let counters = Arc::new(LiveCounters::new(invalidations.clone(), metrics.clone()));
    {
        let counters = counters.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            counters.run(counters_sub, shutdown).await;
        });
    }

    // Background refetch (if interval > 0)
    let refetch_secs = config.history_refetch_interval_secs();
    if refetch_secs > 0 {
        let poller = HistoryPoller::new(
            history.clone(),
            source,
            counters.clone(),
            config.history_page_size(),
            Duration::from_secs(refetch_secs),
        );
        let site_rx = site_rx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            poller.run(site_rx, shutdown).await;
        });
    }

    let mut reconciler = PresenceReconciler::new(config.site_id().clone(), invalidations, metrics.clone());

    // HTTP read surface (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let state = HttpState {
            metrics: metrics.clone(),
            presence: reconciler.watch(),
            counters: counters.clone(),
            history: history.clone(),
            site_tx: site_tx.clone(),
            page_size: config.history_page_size(),
        };
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                presence_gateway::io::http::start_http_server(http_port, state, http_shutdown).await
            {
                tracing::error!(error = %e, "http_server_error");
            }
        });
    }

    // Periodic metrics summary. The same tick restarts a transport session
    // that ran out of reconnect attempts.
    {
        let metrics = metrics.clone();
        let transport = transport.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(config.metrics_interval_secs());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        metrics.report().log();
                        transport.connect();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Reconciler runs on the main task until shutdown
    reconciler.run(reconciler_sub, site_rx, shutdown_rx).await;

    transport.disconnect().await;
    info!("presence-gateway shutdown complete");
    Ok(())
}
