//! Presence reconciliation for the active site
//!
//! The reconciler owns the current presence map and folds each alert into it.
//! Snapshots are immutable: every applied alert swaps in a fresh
//! `Arc<PresenceMap>` and publishes it on a watch channel, so readers never
//! observe a half-applied event.


use crate::domain::presence::{apply_event, PresenceMap, PresenceRecord};
use crate::domain::types::{SiteId, TransportEvent, VisitEvent};
use crate::infra::metrics::Metrics;
use crate::io::transport::Subscription;
use crate::services::invalidation::InvalidationSender;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Presence map published for one site
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub site_id: SiteId,
    pub map: Arc<PresenceMap>,
}

pub struct PresenceReconciler {
    site_id: SiteId,
    snapshot: Arc<PresenceMap>,
    invalidations: InvalidationSender,
    metrics: Arc<Metrics>,
    snapshot_tx: watch::Sender<PresenceSnapshot>,
}

impl PresenceReconciler {
    pub fn new(site_id: SiteId, invalidations: InvalidationSender, metrics: Arc<Metrics>) -> Self {
        let snapshot = Arc::new(PresenceMap::new());
        let (snapshot_tx, _) = watch::channel(PresenceSnapshot {
            site_id: site_id.clone(),
            map: snapshot.clone(),
        });
        Self { site_id, snapshot, invalidations, metrics, snapshot_tx }
    }

    /// Receiver that always holds the latest published snapshot
    pub fn watch(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    pub fn snapshot(&self) -> Arc<PresenceMap> {
        self.snapshot.clone()
    }

    pub fn records(&self) -> Vec<PresenceRecord> {
        self.snapshot.to_list()
    }

    /// Fold one alert into the presence map.
    ///
    /// Returns false when the alert belongs to another site and was ignored.
    pub fn apply(&mut self, event: &VisitEvent) -> bool {
        if event.site_id != self.site_id {
            self.metrics.record_alert_discarded();
            debug!(
                site_id = %event.site_id,
                active_site = %self.site_id,
                event_id = %event.event_id,
                "alert_other_site"
            );
            return false;
        }

        let start = Instant::now();
        let next = Arc::new(apply_event(&self.snapshot, event, &self.site_id));
        self.snapshot = next;
        self.metrics.record_alert_applied(start.elapsed().as_micros() as u64);
        self.metrics.set_presence(self.snapshot.len(), self.snapshot.inside_count());
        self.publish();

        debug!(
            visitor_id = %event.visitor_id,
            direction = %event.direction.as_str(),
            zone_id = %event.zone_id,
            ts = event.timestamp,
            "alert_applied"
        );

        self.invalidations.invalidate(&self.site_id);
        true
    }

    /// Start over with an empty map for `site_id`. No-op for the current site.
    pub fn switch_site(&mut self, site_id: SiteId) -> bool {
        if site_id == self.site_id {
            return false;
        }
        info!(from = %self.site_id, to = %site_id, dropped = self.snapshot.len(), "site_switched");
        self.site_id = site_id;
        self.snapshot = Arc::new(PresenceMap::new());
        self.metrics.record_site_switch();
        self.metrics.set_presence(0, 0);
        self.publish();
        true
    }

    fn publish(&self) {
        // send_replace keeps the value even when nobody is watching
        self.snapshot_tx.send_replace(PresenceSnapshot {
            site_id: self.site_id.clone(),
            map: self.snapshot.clone(),
        });
    }

    /// Main loop: apply alerts, follow site switches, stop on shutdown.
    ///
    /// Occupancy pushes on the same subscription are left to the live
    /// counters.
    pub async fn run(
        &mut self,
        mut subscription: Subscription,
        mut site_rx: watch::Receiver<SiteId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut site_open = true;
        info!(site_id = %self.site_id, "reconciler_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = site_rx.changed(), if site_open => {
                    if changed.is_err() {
                        site_open = false;
                        continue;
                    }
                    let next = site_rx.borrow_and_update().clone();
                    if self.switch_site(next) {
                        // Anything buffered was addressed to the previous view
                        subscription = subscription.resubscribe();
                    }
                }
                received = subscription.recv() => {
                    match received {
                        Ok(TransportEvent::Alert(event)) => {
                            self.apply(&event);
                        }
                        Ok(TransportEvent::LiveOccupancy(_)) => {}
                        Err(RecvError::Lagged(missed)) => {
                            self.metrics.record_transport_lagged(missed);
                            warn!(missed = missed, site_id = %self.site_id, "reconciler_lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        info!(site_id = %self.site_id, records = self.snapshot.len(), "reconciler_stopped");
    }
}
