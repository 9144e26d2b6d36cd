//! Live footfall and occupancy overlay
//!
//! Footfall is seeded from the analytics API and then bumped by each plain
//! `entry` alert. Occupancy is replaced wholesale by `live_occupancy` pushes.
//! Every alert, for any site, also marks that site's history stale.

use crate::domain::types::{Direction, LiveOccupancyEvent, SiteId, TransportEvent, VisitEvent};
use crate::infra::metrics::Metrics;
use crate::io::transport::Subscription;
use crate::services::invalidation::InvalidationSender;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteCounters {
    /// Visitors counted today; unknown until seeded from the API
    pub footfall: Option<u64>,
    pub current_occupancy: Option<i64>,
    /// Timestamp of the occupancy push that set `current_occupancy`
    pub last_updated: Option<i64>,
}

pub struct LiveCounters {
    sites: RwLock<FxHashMap<SiteId, SiteCounters>>,
    invalidations: InvalidationSender,
    metrics: Arc<Metrics>,
}

impl LiveCounters {
    pub fn new(invalidations: InvalidationSender, metrics: Arc<Metrics>) -> Self {
        Self { sites: RwLock::new(FxHashMap::default()), invalidations, metrics }
    }

    pub fn get(&self, site_id: &SiteId) -> SiteCounters {
        self.sites.read().get(site_id).cloned().unwrap_or_default()
    }

    /// Replace the footfall baseline with the API's figure
    pub fn seed_footfall(&self, site_id: &SiteId, footfall: u64) {
        self.sites.write().entry(site_id.clone()).or_default().footfall = Some(footfall);
    }

    pub fn on_alert(&self, event: &VisitEvent) {
        // Zone transitions move people around inside the site; only the
        // site-level entry counts toward footfall
        if event.direction == Direction::Entry {
            if let Some(counters) = self.sites.write().get_mut(&event.site_id) {
                if let Some(footfall) = counters.footfall.as_mut() {
                    *footfall += 1;
                }
            }
        }
        self.invalidations.invalidate(&event.site_id);
    }

    pub fn on_occupancy(&self, event: &LiveOccupancyEvent) {
        self.metrics.record_occupancy_update();
        let mut sites = self.sites.write();
        let counters = sites.entry(event.site_id.clone()).or_default();
        counters.current_occupancy = Some(event.site_occupancy);
        counters.last_updated = Some(event.timestamp);
    }

    /// Consume transport events until the subscription closes or shutdown
    pub async fn run(&self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = subscription.recv() => {
                    match received {
                        Ok(TransportEvent::Alert(event)) => self.on_alert(&event),
                        Ok(TransportEvent::LiveOccupancy(event)) => {
                            debug!(site_id = %event.site_id, occupancy = event.site_occupancy, "live_occupancy");
                            self.on_occupancy(&event);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            self.metrics.record_transport_lagged(missed);
                            warn!(missed = missed, "live_counters_lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        info!("live_counters_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Severity, VisitorId};
    use crate::services::invalidation::{create_invalidation_channel, Invalidation};
    use tokio::sync::mpsc;

    fn alert(direction: Direction, site: &str) -> VisitEvent {
        VisitEvent {
            timestamp: 1,
            event_id: "e".to_string(),
            direction,
            visitor_id: VisitorId::from("P1"),
            visitor_name: String::new(),
            gender: None,
            zone_id: "Z1".to_string(),
            zone_name: String::new(),
            site_id: SiteId::from(site),
            site_name: String::new(),
            severity: Severity::High,
        }
    }

    fn counters() -> (LiveCounters, mpsc::Receiver<Invalidation>) {
        let metrics = Arc::new(Metrics::new());
        let (sender, rx) = create_invalidation_channel(16, metrics.clone());
        (LiveCounters::new(sender, metrics), rx)
    }

    #[test]
    fn test_entry_increments_seeded_footfall() {
        let (counters, _rx) = counters();
        let s1 = SiteId::from("S1");
        counters.seed_footfall(&s1, 10);

        counters.on_alert(&alert(Direction::Entry, "S1"));
        counters.on_alert(&alert(Direction::ZoneEntry, "S1"));
        counters.on_alert(&alert(Direction::Exit, "S1"));

        assert_eq!(counters.get(&s1).footfall, Some(11));
    }

    #[test]
    fn test_entry_without_baseline_is_ignored() {
        let (counters, _rx) = counters();
        counters.on_alert(&alert(Direction::Entry, "S1"));
        assert_eq!(counters.get(&SiteId::from("S1")).footfall, None);
    }

    #[test]
    fn test_every_alert_invalidates_its_site() {
        let (counters, mut rx) = counters();
        counters.on_alert(&alert(Direction::ZoneExit, "S2"));
        assert_eq!(rx.try_recv().unwrap(), Invalidation { site_id: SiteId::from("S2") });
    }

    #[test]
    fn test_occupancy_push_sets_current_value() {
        let (counters, _rx) = counters();
        let s1 = SiteId::from("S1");
        counters.seed_footfall(&s1, 8);
        assert_eq!(counters.get(&s1).current_occupancy, None);

        counters.on_occupancy(&LiveOccupancyEvent {
            timestamp: 99,
            site_id: s1.clone(),
            site_occupancy: 17,
            zone_id: "Z1".to_string(),
            zone_occupancy: 4,
        });

        let live = counters.get(&s1);
        assert_eq!(live.current_occupancy, Some(17));
        assert_eq!(live.last_updated, Some(99));
        assert_eq!(live.footfall, Some(8));
    }

    #[tokio::test]
    async fn test_run_consumes_subscription() {
        let (counters, _rx) = counters();
        let s1 = SiteId::from("S1");
        counters.seed_footfall(&s1, 0);

        let (tx, sub) = tokio::sync::broadcast::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(TransportEvent::Alert(alert(Direction::Entry, "S1"))).unwrap();
        tx.send(TransportEvent::Alert(alert(Direction::Entry, "S1"))).unwrap();
        drop(tx);

        counters.run(sub, shutdown_rx).await;
        assert_eq!(counters.get(&s1).footfall, Some(2));
    }
}
