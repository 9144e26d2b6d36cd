//! End-to-end: transport events -> reconciler -> invalidation -> history cache

use async_trait::async_trait;
use presence_gateway::domain::history::{HistoryKey, HistoryPage, HistoryRequest};
use presence_gateway::domain::types::{SiteId, TransportEvent, VisitorId};
use presence_gateway::infra::Metrics;
use presence_gateway::io::analytics_api::{
    AnalyticsSource, ApiError, FootfallResponse, GenderMap, RangeRequest,
};
use presence_gateway::io::transport::parse_message;
use presence_gateway::services::{create_invalidation_channel, HistoryCache, PresenceReconciler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[derive(Default)]
struct CountingSource {
    history_calls: AtomicUsize,
}

#[async_trait]
impl AnalyticsSource for CountingSource {
    async fn fetch_history(&self, request: &HistoryRequest) -> Result<HistoryPage, ApiError> {
        let n = self.history_calls.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(HistoryPage {
            site_id: request.site_id.clone(),
            total_records: n,
            total_pages: 1,
            page_number: request.page_number,
            page_size: request.page_size,
            records: Vec::new(),
        })
    }

    async fn fetch_gender_map(&self, _range: &RangeRequest) -> Result<GenderMap, ApiError> {
        Ok(GenderMap::default())
    }

    async fn fetch_footfall(&self, range: &RangeRequest) -> Result<FootfallResponse, ApiError> {
        Ok(FootfallResponse {
            site_id: range.site_id.clone(),
            from_utc: range.from_utc,
            to_utc: range.to_utc,
            footfall: 0,
        })
    }
}

fn alert(ts: i64, direction: &str, person: &str, site: &str) -> TransportEvent {
    let payload = format!(
        r#"{{"ts": {ts}, "eventId": "e-{ts}", "direction": "{direction}", "personId": "{person}",
            "personName": "N", "zoneId": "Z1", "zoneName": "Lobby", "siteId": "{site}",
            "siteName": "Site", "severity": "low"}}"#
    );
    parse_message("analytics/alert", "analytics", payload.as_bytes()).unwrap()
}

#[tokio::test]
async fn test_alerts_reconcile_and_invalidate_history() {
    let metrics = Arc::new(Metrics::new());
    let source = Arc::new(CountingSource::default());
    let cache = Arc::new(HistoryCache::new(
        source.clone(),
        Duration::from_secs(300),
        Duration::from_secs(300),
        metrics.clone(),
    ));
    let (invalidations, invalidation_rx) = create_invalidation_channel(64, metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_cache = cache.clone();
    let worker_shutdown = shutdown_rx.clone();
    let worker = tokio::spawn(async move {
        worker_cache.run_invalidations(invalidation_rx, worker_shutdown).await;
    });

    let s1 = SiteId::from("S1");
    let key = HistoryKey::new(s1.clone(), 1, 25);
    cache.get(&key).await.unwrap();
    assert!(cache.is_fresh(&key));

    let mut reconciler = PresenceReconciler::new(s1.clone(), invalidations, metrics.clone());
    let (tx, sub) = broadcast::channel(16);
    let (_site_tx, site_rx) = watch::channel(s1.clone());

    tx.send(alert(1000, "entry", "P1", "S1")).unwrap();
    tx.send(alert(301_000, "exit", "P1", "S1")).unwrap();
    tx.send(alert(400_000, "entry", "P2", "S2")).unwrap();
    drop(tx);

    reconciler.run(sub, site_rx, shutdown_rx).await;

    let records = reconciler.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].visitor_id, VisitorId::from("P1"));
    assert_eq!(records[0].dwell_minutes, Some(5));

    // Wait for the worker to mark the page stale
    tokio::time::timeout(Duration::from_secs(1), async {
        while cache.is_fresh(&key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("history page should be invalidated");

    let page = cache.get(&key).await.unwrap();
    assert_eq!(page.total_records, 1);
    assert_eq!(source.history_calls.load(Ordering::SeqCst), 2);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
}
