//! HTTP read surface
//!
//! Serves the presence snapshot, live counters, cached history and
//! Prometheus metrics. `PUT /site` switches the active site.
//! Uses hyper for the HTTP server.

use crate::domain::history::HistoryKey;
use crate::domain::types::SiteId;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::analytics_api::ApiError;
use crate::services::history_cache::HistoryCache;
use crate::services::live_counters::{LiveCounters, SiteCounters};
use crate::services::reconciler::PresenceSnapshot;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Everything the handlers read from
#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub presence: watch::Receiver<PresenceSnapshot>,
    pub counters: Arc<LiveCounters>,
    pub history: Arc<HistoryCache>,
    pub site_tx: Arc<watch::Sender<SiteId>>,
    pub page_size: u32,
}

impl HttpState {
    fn active_site(&self) -> SiteId {
        self.site_tx.borrow().clone()
    }
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_presence_metrics(&mut output, site_id, &summary);
    write_transport_metrics(&mut output, site_id, &summary);
    write_history_metrics(&mut output, site_id, &summary);

    output
}

fn write_presence_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "presence_alerts_applied_total",
        "Alerts folded into the presence map",
        MetricType::Counter,
        site,
        summary.alerts_applied,
    );
    write_metric(
        output,
        "presence_alerts_discarded_total",
        "Alerts for another site",
        MetricType::Counter,
        site,
        summary.alerts_discarded,
    );
    write_metric(
        output,
        "presence_records",
        "Visitors in the presence map",
        MetricType::Gauge,
        site,
        summary.presence_records,
    );
    write_metric(
        output,
        "presence_inside",
        "Visitors with an open entry",
        MetricType::Gauge,
        site,
        summary.presence_inside,
    );
    write_metric(
        output,
        "presence_site_switches_total",
        "Active site changes",
        MetricType::Counter,
        site,
        summary.site_switches,
    );
    write_histogram(
        output,
        "presence_apply_latency_us",
        "Alert fold latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_apply_latency_us,
    );
}

fn write_transport_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "presence_occupancy_updates_total",
        "Live occupancy pushes received",
        MetricType::Counter,
        site,
        summary.occupancy_updates,
    );
    write_metric(
        output,
        "presence_malformed_events_total",
        "Messages rejected at the transport boundary",
        MetricType::Counter,
        site,
        summary.malformed_total,
    );
    write_metric(
        output,
        "presence_unknown_direction_total",
        "Alerts with an unrecognized direction",
        MetricType::Counter,
        site,
        summary.unknown_direction_total,
    );
    write_metric(
        output,
        "presence_transport_connects_total",
        "Broker connections established",
        MetricType::Counter,
        site,
        summary.transport_connects,
    );
    write_metric(
        output,
        "presence_transport_lagged_total",
        "Events missed by slow subscribers",
        MetricType::Counter,
        site,
        summary.transport_lagged,
    );
}

fn write_history_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "presence_invalidations_total",
        "History staleness signals delivered",
        MetricType::Counter,
        site,
        summary.invalidations_sent,
    );
    write_metric(
        output,
        "presence_invalidations_dropped_total",
        "History staleness signals dropped",
        MetricType::Counter,
        site,
        summary.invalidations_dropped,
    );
    write_metric(
        output,
        "presence_history_cache_hits_total",
        "History pages served from cache",
        MetricType::Counter,
        site,
        summary.history_cache_hits,
    );
    write_metric(
        output,
        "presence_history_fetches_total",
        "History pages fetched from the analytics API",
        MetricType::Counter,
        site,
        summary.history_fetches,
    );
    write_metric(
        output,
        "presence_history_fetch_errors_total",
        "Failed history fetches",
        MetricType::Counter,
        site,
        summary.history_fetch_errors,
    );
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveView {
    site_id: SiteId,
    #[serde(flatten)]
    counters: SiteCounters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteSelection {
    site_id: String,
}

/// `page` from a query string, defaulting to 1. Zero and garbage are rejected.
fn page_param(query: Option<&str>) -> Option<u32> {
    let Some(query) = query else { return Some(1) };
    match query.split('&').find_map(|pair| pair.strip_prefix("page=")) {
        Some(raw) => raw.parse::<u32>().ok().filter(|&p| p > 0),
        None => Some(1),
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_serialize_error");
            respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "serialize error")
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json(status, &serde_json::json!({ "ok": false, "error": message }))
}

/// Dispatch one request. Split from the hyper plumbing so it can be tested
/// without a socket.
async fn route(
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: Bytes,
    state: &HttpState,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let site = state.active_site();
            respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&state.metrics, &site.0),
            )
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/presence") => {
            let snapshot = state.presence.borrow().clone();
            json(StatusCode::OK, &snapshot.map.to_list())
        }
        (&Method::GET, "/live") => {
            let site_id = state.active_site();
            let counters = state.counters.get(&site_id);
            json(StatusCode::OK, &LiveView { site_id, counters })
        }
        (&Method::GET, "/history") => {
            let Some(page) = page_param(query) else {
                return json_error(StatusCode::BAD_REQUEST, "page must be a positive integer");
            };
            let key = HistoryKey::new(state.active_site(), page, state.page_size);
            match state.history.get(&key).await {
                Ok(page) => json(StatusCode::OK, page.as_ref()),
                Err(ApiError::Unauthorized) => {
                    json_error(StatusCode::UNAUTHORIZED, &ApiError::Unauthorized.to_string())
                }
                Err(e) => json_error(StatusCode::BAD_GATEWAY, &e.to_string()),
            }
        }
        (&Method::PUT, "/site") => match serde_json::from_slice::<SiteSelection>(&body) {
            Ok(sel) if !sel.site_id.trim().is_empty() => {
                let site_id = SiteId(sel.site_id.trim().to_string());
                info!(site_id = %site_id, "site_selected");
                state.site_tx.send_replace(site_id.clone());
                json(StatusCode::OK, &serde_json::json!({ "ok": true, "siteId": site_id }))
            }
            Ok(_) => json_error(StatusCode::BAD_REQUEST, "siteId must not be empty"),
            Err(e) => {
                warn!(error = %e, "site_selection_invalid");
                json_error(StatusCode::BAD_REQUEST, "expected {\"siteId\": \"...\"}")
            }
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: HttpState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "http_body_error");
            return Ok(json_error(StatusCode::BAD_REQUEST, "unreadable body"));
        }
    };

    Ok(route(&method, &path, query.as_deref(), body, &state).await)
}

/// Start the HTTP server
pub async fn start_http_server(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
