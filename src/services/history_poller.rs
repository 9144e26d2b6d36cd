//! Background refresh for the active site
//!
//! Keeps page 1 of today's history warm and reseeds the footfall baseline on
//! a fixed interval. When the active site changes, the previous site's pages
//! are evicted and the new site is fetched right away.

use crate::domain::history::HistoryKey;
use crate::domain::time::{current_utc, start_of_day_utc};
use crate::domain::types::SiteId;
use crate::io::analytics_api::{AnalyticsSource, RangeRequest};
use crate::services::history_cache::HistoryCache;
use crate::services::live_counters::LiveCounters;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct HistoryPoller {
    cache: Arc<HistoryCache>,
    source: Arc<dyn AnalyticsSource>,
    counters: Arc<LiveCounters>,
    page_size: u32,
    refetch_interval: Duration,
}

impl HistoryPoller {
    pub fn new(
        cache: Arc<HistoryCache>,
        source: Arc<dyn AnalyticsSource>,
        counters: Arc<LiveCounters>,
        page_size: u32,
        refetch_interval: Duration,
    ) -> Self {
        Self { cache, source, counters, page_size, refetch_interval }
    }

    /// One refresh pass for `site_id`. Errors are logged; the next tick retries.
    pub async fn refresh(&self, site_id: &SiteId) {
        let key = HistoryKey::new(site_id.clone(), 1, self.page_size);
        if let Err(e) = self.cache.get(&key).await {
            debug!(site_id = %site_id, error = %e, "history_poll_failed");
        }

        let range = RangeRequest {
            site_id: site_id.clone(),
            from_utc: start_of_day_utc(),
            to_utc: current_utc(),
        };
        match self.source.fetch_footfall(&range).await {
            Ok(resp) => {
                self.counters.seed_footfall(site_id, resp.footfall);
                debug!(site_id = %site_id, footfall = resp.footfall, "footfall_seeded");
            }
            Err(e) => warn!(site_id = %site_id, error = %e, "footfall_fetch_failed"),
        }
    }

    pub async fn run(&self, mut site_rx: watch::Receiver<SiteId>, mut shutdown: watch::Receiver<bool>) {
        let mut site_id = site_rx.borrow_and_update().clone();
        let mut site_open = true;
        let mut ticker = interval(self.refetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            site_id = %site_id,
            interval_secs = self.refetch_interval.as_secs(),
            "history_poller_started"
        );

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
                    if next != site_id {
                        self.cache.evict_site(&site_id);
                        site_id = next;
                        ticker.reset_immediately();
                    }
                }
                _ = ticker.tick() => {
                    self.refresh(&site_id).await;
                }
            }
        }
        info!("history_poller_stopped");
    }
}
