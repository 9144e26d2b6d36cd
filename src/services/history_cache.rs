//! Query cache for paginated visit history
//!
//! Pages are keyed by `(site_id, page, page_size)`. A cached page is served
//! while it is younger than `stale_after` and no staleness signal has arrived
//! for its site. Otherwise the next read refetches. If that refetch fails the
//! old page is kept (still stale) so a later read can try again.
//!
//! Each site carries a generation counter bumped by every staleness signal.
//! A fetch that was in flight when its site was signalled lands already
//! stale. At most `max_pages` pages are held; the oldest fetch goes first.

use crate::domain::history::{HistoryKey, HistoryPage, HistoryRequest};
use crate::domain::time::{current_utc, start_of_day_utc};
use crate::domain::types::SiteId;
use crate::infra::metrics::Metrics;
use crate::io::analytics_api::{AnalyticsSource, ApiError, GenderMap, RangeRequest};
use crate::services::invalidation::Invalidation;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const DEFAULT_MAX_PAGES: usize = 64;

struct CachedPage {
    page: Arc<HistoryPage>,
    fetched_at: Instant,
    invalidated: bool,
}

struct CachedGenders {
    map: Arc<GenderMap>,
    fetched_at: Instant,
}

pub struct HistoryCache {
    source: Arc<dyn AnalyticsSource>,
    pages: Mutex<FxHashMap<HistoryKey, CachedPage>>,
    genders: Mutex<FxHashMap<SiteId, CachedGenders>>,
    generations: Mutex<FxHashMap<SiteId, u64>>,
    stale_after: Duration,
    genders_stale_after: Duration,
    max_pages: usize,
    metrics: Arc<Metrics>,
}

impl HistoryCache {
    pub fn new(
        source: Arc<dyn AnalyticsSource>,
        stale_after: Duration,
        genders_stale_after: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            pages: Mutex::new(FxHashMap::default()),
            genders: Mutex::new(FxHashMap::default()),
            generations: Mutex::new(FxHashMap::default()),
            stale_after,
            genders_stale_after,
            max_pages: DEFAULT_MAX_PAGES,
            metrics,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Number of pages currently held, fresh or stale
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    fn generation(&self, site_id: &SiteId) -> u64 {
        self.generations.lock().get(site_id).copied().unwrap_or(0)
    }

    /// True if the next `get` for `key` would be served from cache
    pub fn is_fresh(&self, key: &HistoryKey) -> bool {
        self.pages
            .lock()
            .get(key)
            .map(|c| !c.invalidated && c.fetched_at.elapsed() < self.stale_after)
            .unwrap_or(false)
    }

    /// Cached page without any freshness check
    pub fn peek(&self, key: &HistoryKey) -> Option<Arc<HistoryPage>> {
        self.pages.lock().get(key).map(|c| c.page.clone())
    }

    /// Read one page, refetching if it is missing, expired, or invalidated
    pub async fn get(&self, key: &HistoryKey) -> Result<Arc<HistoryPage>, ApiError> {
        if self.is_fresh(key) {
            if let Some(page) = self.peek(key) {
                self.metrics.record_history_cache_hit();
                return Ok(page);
            }
        }

        let generation = self.generation(&key.site_id);
        let request = HistoryRequest {
            site_id: key.site_id.clone(),
            from_utc: start_of_day_utc(),
            to_utc: current_utc(),
            page_number: key.page,
            page_size: key.page_size,
        };

        let mut page = match self.source.fetch_history(&request).await {
            Ok(page) => {
                self.metrics.record_history_fetch(true);
                page
            }
            Err(e) => {
                self.metrics.record_history_fetch(false);
                warn!(site_id = %key.site_id, page = key.page, error = %e, "history_fetch_failed");
                return Err(e);
            }
        };

        if let Some(genders) = self.gender_map(&request).await {
            for record in &mut page.records {
                if let Some(g) = genders.get(&record.person_id) {
                    record.gender = Some(g.clone());
                }
            }
        }

        debug!(
            site_id = %key.site_id,
            page = key.page,
            total_records = page.total_records,
            "history_page_fetched"
        );

        let page = Arc::new(page);
        // Hold the generation lock across the insert so a concurrent signal
        // either sees this page or bumps the generation before it is compared
        let generations = self.generations.lock();
        let invalidated = generations.get(&key.site_id).copied().unwrap_or(0) != generation;
        let mut pages = self.pages.lock();
        if !pages.contains_key(key) {
            evict_oldest(&mut pages, self.max_pages - 1);
        }
        pages.insert(
            key.clone(),
            CachedPage { page: page.clone(), fetched_at: Instant::now(), invalidated },
        );
        Ok(page)
    }

    /// Gender lookup for enrichment. Failures only cost the enrichment.
    async fn gender_map(&self, request: &HistoryRequest) -> Option<Arc<GenderMap>> {
        let cached = self
            .genders
            .lock()
            .get(&request.site_id)
            .filter(|c| c.fetched_at.elapsed() < self.genders_stale_after)
            .map(|c| c.map.clone());
        if cached.is_some() {
            return cached;
        }

        let range = RangeRequest {
            site_id: request.site_id.clone(),
            from_utc: request.from_utc,
            to_utc: request.to_utc,
        };
        match self.source.fetch_gender_map(&range).await {
            Ok(map) => {
                let map = Arc::new(map);
                self.genders.lock().insert(
                    request.site_id.clone(),
                    CachedGenders { map: map.clone(), fetched_at: Instant::now() },
                );
                Some(map)
            }
            Err(e) => {
                debug!(site_id = %request.site_id, error = %e, "gender_map_unavailable");
                None
            }
        }
    }

    /// Mark every cached page of `site_id` stale. Returns how many were marked.
    pub fn invalidate_site(&self, site_id: &SiteId) -> usize {
        let mut generations = self.generations.lock();
        *generations.entry(site_id.clone()).or_insert(0) += 1;
        let mut pages = self.pages.lock();
        let mut marked = 0;
        for (key, cached) in pages.iter_mut() {
            if key.site_id == *site_id && !cached.invalidated {
                cached.invalidated = true;
                marked += 1;
            }
        }
        marked
    }

    /// Drop everything cached for a site (used on site switch)
    pub fn evict_site(&self, site_id: &SiteId) {
        self.pages.lock().retain(|key, _| key.site_id != *site_id);
        self.genders.lock().remove(site_id);
    }

    /// Apply staleness signals until the channel closes or shutdown
    pub async fn run_invalidations(
        &self,
        mut rx: mpsc::Receiver<Invalidation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => {
                    let Some(Invalidation { site_id }) = msg else { break };
                    let marked = self.invalidate_site(&site_id);
                    if marked > 0 {
                        debug!(site_id = %site_id, pages = marked, "history_invalidated");
                    }
                }
            }
        }
        info!("history_invalidation_worker_stopped");
    }
}

fn evict_oldest(pages: &mut FxHashMap<HistoryKey, CachedPage>, keep: usize) {
    while pages.len() > keep {
        let oldest = pages.iter().min_by_key(|(_, c)| c.fetched_at).map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                pages.remove(&key);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::history::HistoryRecord;
    use crate::io::analytics_api::FootfallResponse;
    use crate::services::invalidation::create_invalidation_channel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeSource {
        history_calls: AtomicUsize,
        gender_calls: AtomicUsize,
        fail_history: AtomicBool,
        /// Park history fetches until `release_fetch` is notified
        hold_history: AtomicBool,
        fetch_started: Notify,
        release_fetch: Notify,
    }

    #[async_trait]
    impl AnalyticsSource for FakeSource {
        async fn fetch_history(&self, request: &HistoryRequest) -> Result<HistoryPage, ApiError> {
            let n = self.history_calls.fetch_add(1, Ordering::SeqCst) as u64;
            if self.hold_history.load(Ordering::SeqCst) {
                self.fetch_started.notify_one();
                self.release_fetch.notified().await;
            }
            if self.fail_history.load(Ordering::SeqCst) {
                return Err(ApiError::Status { status: 503, message: "down".to_string() });
            }
            Ok(HistoryPage {
                site_id: request.site_id.clone(),
                total_records: n + 1,
                total_pages: 1,
                page_number: request.page_number,
                page_size: request.page_size,
                records: vec![HistoryRecord {
                    person_id: "P1".to_string(),
                    person_name: "Ada".to_string(),
                    zone_id: "Z1".to_string(),
                    zone_name: "Lobby".to_string(),
                    severity: "low".to_string(),
                    entry_utc: Some(1000),
                    entry_local: None,
                    exit_utc: Some(301_000),
                    exit_local: None,
                    dwell_minutes: Some(5.0),
                    gender: None,
                }],
            })
        }

        async fn fetch_gender_map(&self, _range: &RangeRequest) -> Result<GenderMap, ApiError> {
            self.gender_calls.fetch_add(1, Ordering::SeqCst);
            let mut map = GenderMap::default();
            map.insert("P1".to_string(), "female".to_string());
            Ok(map)
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

    fn cache_with(source: Arc<FakeSource>) -> HistoryCache {
        HistoryCache::new(
            source,
            Duration::from_secs(60),
            Duration::from_secs(300),
            Arc::new(Metrics::new()),
        )
    }

    fn key(site: &str, page: u32) -> HistoryKey {
        HistoryKey::new(SiteId::from(site), page, 25)
    }

    #[tokio::test]
    async fn test_second_read_is_cached() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(source.clone());

        let first = cache.get(&key("S1", 1)).await.unwrap();
        let second = cache.get(&key("S1", 1)).await.unwrap();

        assert_eq!(source.history_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.total_records, second.total_records);
        assert_eq!(cache.metrics.history_cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_forces_refetch() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(source.clone());

        cache.get(&key("S1", 1)).await.unwrap();
        cache.get(&key("S1", 2)).await.unwrap();
        cache.get(&key("S2", 1)).await.unwrap();
        assert_eq!(cache.invalidate_site(&SiteId::from("S1")), 2);
        assert!(!cache.is_fresh(&key("S1", 1)));
        assert!(cache.is_fresh(&key("S2", 1)));

        let page = cache.get(&key("S1", 1)).await.unwrap();
        assert_eq!(source.history_calls.load(Ordering::SeqCst), 4);
        assert_eq!(page.total_records, 4);
        assert!(cache.is_fresh(&key("S1", 1)));
    }

    #[tokio::test]
    async fn test_expired_page_is_refetched() {
        let source = Arc::new(FakeSource::default());
        let cache = HistoryCache::new(
            source.clone(),
            Duration::ZERO,
            Duration::from_secs(300),
            Arc::new(Metrics::new()),
        );

        cache.get(&key("S1", 1)).await.unwrap();
        cache.get(&key("S1", 1)).await.unwrap();
        assert_eq!(source.history_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_records_are_enriched_with_gender() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(source.clone());

        let page = cache.get(&key("S1", 1)).await.unwrap();
        assert_eq!(page.records[0].gender.as_deref(), Some("female"));

        cache.invalidate_site(&SiteId::from("S1"));
        cache.get(&key("S1", 1)).await.unwrap();
        assert_eq!(source.gender_calls.load(Ordering::SeqCst), 1, "gender map is cached");
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_stale_page() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(source.clone());

        cache.get(&key("S1", 1)).await.unwrap();
        cache.invalidate_site(&SiteId::from("S1"));
        source.fail_history.store(true, Ordering::SeqCst);

        assert!(cache.get(&key("S1", 1)).await.is_err());
        assert!(cache.peek(&key("S1", 1)).is_some());
        assert!(!cache.is_fresh(&key("S1", 1)));
    }

    #[tokio::test]
    async fn test_invalidation_worker_applies_signals() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(cache_with(source));
        cache.get(&key("S1", 1)).await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let (sender, rx) = create_invalidation_channel(8, metrics);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_cache = cache.clone();
        let worker =
            tokio::spawn(async move { worker_cache.run_invalidations(rx, shutdown_rx).await });

        sender.invalidate(&SiteId::from("S1"));
        drop(sender);
        worker.await.unwrap();

        assert!(!cache.is_fresh(&key("S1", 1)));
    }

    #[tokio::test]
    async fn test_evict_site() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(source);
        cache.get(&key("S1", 1)).await.unwrap();
        cache.evict_site(&SiteId::from("S1"));
        assert!(cache.peek(&key("S1", 1)).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_signal_during_fetch_leaves_page_stale() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(cache_with(source.clone()));
        let s1 = SiteId::from("S1");

        cache.get(&key("S1", 1)).await.unwrap();
        cache.invalidate_site(&s1);
        source.hold_history.store(true, Ordering::SeqCst);

        let reader = cache.clone();
        let refetch = tokio::spawn(async move { reader.get(&key("S1", 1)).await });
        source.fetch_started.notified().await;

        // New data lands while the refetch is already on the wire
        cache.invalidate_site(&s1);
        source.release_fetch.notify_one();

        let page = refetch.await.unwrap().unwrap();
        assert_eq!(page.total_records, 2);
        assert!(!cache.is_fresh(&key("S1", 1)));

        source.hold_history.store(false, Ordering::SeqCst);
        let page = cache.get(&key("S1", 1)).await.unwrap();
        assert_eq!(page.total_records, 3);
        assert!(cache.is_fresh(&key("S1", 1)));
    }

    #[tokio::test]
    async fn test_signal_for_other_site_during_fetch_is_ignored() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(cache_with(source.clone()));
        source.hold_history.store(true, Ordering::SeqCst);

        let reader = cache.clone();
        let fetch = tokio::spawn(async move { reader.get(&key("S1", 1)).await });
        source.fetch_started.notified().await;
        cache.invalidate_site(&SiteId::from("S2"));
        source.release_fetch.notify_one();

        fetch.await.unwrap().unwrap();
        assert!(cache.is_fresh(&key("S1", 1)));
    }

    #[tokio::test]
    async fn test_page_sweep_is_bounded() {
        let source = Arc::new(FakeSource::default());
        let cache = cache_with(source.clone()).with_max_pages(8);

        for page in 1..=100 {
            cache.get(&key("S1", page)).await.unwrap();
        }

        assert_eq!(source.history_calls.load(Ordering::SeqCst), 100);
        assert_eq!(cache.len(), 8);
        // The most recent fetches survive
        assert!(cache.peek(&key("S1", 100)).is_some());
        assert!(cache.peek(&key("S1", 1)).is_none());
    }
}
