//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting swaps the per-interval
//! counters to get a consistent snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    // Last bucket reports twice the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Alerts folded into the presence map (monotonic)
    alerts_applied: AtomicU64,
    /// Alerts for a site other than the active one (monotonic)
    alerts_discarded: AtomicU64,
    /// Alerts since last report (reset on report)
    alerts_since_report: AtomicU64,
    /// Occupancy updates received (monotonic)
    occupancy_updates: AtomicU64,
    /// Messages rejected at the transport boundary (monotonic)
    malformed_total: AtomicU64,
    /// Of which: unrecognized direction (monotonic)
    unknown_direction_total: AtomicU64,
    /// Staleness signals delivered to the history cache (monotonic)
    invalidations_sent: AtomicU64,
    /// Staleness signals dropped (channel full or closed) (monotonic)
    invalidations_dropped: AtomicU64,
    /// History pages served from cache (monotonic)
    history_cache_hits: AtomicU64,
    /// History pages fetched from the API (monotonic)
    history_fetches: AtomicU64,
    /// History fetch failures (monotonic)
    history_fetch_errors: AtomicU64,
    /// Broker (re)connections (monotonic)
    transport_connects: AtomicU64,
    /// Events a slow subscriber missed (monotonic)
    transport_lagged: AtomicU64,
    /// Site switches (monotonic)
    site_switches: AtomicU64,
    /// Records in the current presence snapshot (gauge)
    presence_records: AtomicU64,
    /// Visitors currently inside (gauge)
    presence_inside: AtomicU64,
    /// Fold latency histogram (reset on report)
    apply_latency_buckets: [AtomicU64; NUM_BUCKETS],
    apply_latency_sum_us: AtomicU64,
    apply_latency_max_us: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            alerts_applied: AtomicU64::new(0),
            alerts_discarded: AtomicU64::new(0),
            alerts_since_report: AtomicU64::new(0),
            occupancy_updates: AtomicU64::new(0),
            malformed_total: AtomicU64::new(0),
            unknown_direction_total: AtomicU64::new(0),
            invalidations_sent: AtomicU64::new(0),
            invalidations_dropped: AtomicU64::new(0),
            history_cache_hits: AtomicU64::new(0),
            history_fetches: AtomicU64::new(0),
            history_fetch_errors: AtomicU64::new(0),
            transport_connects: AtomicU64::new(0),
            transport_lagged: AtomicU64::new(0),
            site_switches: AtomicU64::new(0),
            presence_records: AtomicU64::new(0),
            presence_inside: AtomicU64::new(0),
            apply_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            apply_latency_sum_us: AtomicU64::new(0),
            apply_latency_max_us: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_alert_applied(&self, latency_us: u64) {
        self.alerts_applied.fetch_add(1, Ordering::Relaxed);
        self.alerts_since_report.fetch_add(1, Ordering::Relaxed);
        self.apply_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.apply_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.apply_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_alert_discarded(&self) {
        self.alerts_discarded.fetch_add(1, Ordering::Relaxed);
        self.alerts_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_occupancy_update(&self) {
        self.occupancy_updates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self, unknown_direction: bool) {
        self.malformed_total.fetch_add(1, Ordering::Relaxed);
        if unknown_direction {
            self.unknown_direction_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_invalidation_sent(&self) {
        self.invalidations_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalidation_dropped(&self) {
        self.invalidations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_history_cache_hit(&self) {
        self.history_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_history_fetch(&self, ok: bool) {
        self.history_fetches.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.history_fetch_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_transport_connect(&self) {
        self.transport_connects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transport_lagged(&self, missed: u64) {
        self.transport_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_site_switch(&self) {
        self.site_switches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_presence(&self, records: usize, inside: usize) {
        self.presence_records.store(records as u64, Ordering::Relaxed);
        self.presence_inside.store(inside as u64, Ordering::Relaxed);
    }

    pub fn alerts_applied(&self) -> u64 {
        self.alerts_applied.load(Ordering::Relaxed)
    }

    pub fn alerts_discarded(&self) -> u64 {
        self.alerts_discarded.load(Ordering::Relaxed)
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed_total.load(Ordering::Relaxed)
    }

    pub fn invalidations_sent(&self) -> u64 {
        self.invalidations_sent.load(Ordering::Relaxed)
    }

    pub fn invalidations_dropped(&self) -> u64 {
        self.invalidations_dropped.load(Ordering::Relaxed)
    }

    pub fn history_cache_hits(&self) -> u64 {
        self.history_cache_hits.load(Ordering::Relaxed)
    }

    pub fn history_fetches(&self) -> u64 {
        self.history_fetches.load(Ordering::Relaxed)
    }

    /// Snapshot and reset the per-interval counters
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let alerts_interval = self.alerts_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.apply_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.apply_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.apply_latency_buckets);
        let applied_interval: u64 = lat_buckets.iter().sum();

        MetricsSummary {
            alerts_applied: self.alerts_applied.load(Ordering::Relaxed),
            alerts_discarded: self.alerts_discarded.load(Ordering::Relaxed),
            alerts_per_sec: if elapsed_secs > 0.0 {
                alerts_interval as f64 / elapsed_secs
            } else {
                0.0
            },
            occupancy_updates: self.occupancy_updates.load(Ordering::Relaxed),
            malformed_total: self.malformed_total.load(Ordering::Relaxed),
            unknown_direction_total: self.unknown_direction_total.load(Ordering::Relaxed),
            invalidations_sent: self.invalidations_sent.load(Ordering::Relaxed),
            invalidations_dropped: self.invalidations_dropped.load(Ordering::Relaxed),
            history_cache_hits: self.history_cache_hits.load(Ordering::Relaxed),
            history_fetches: self.history_fetches.load(Ordering::Relaxed),
            history_fetch_errors: self.history_fetch_errors.load(Ordering::Relaxed),
            transport_connects: self.transport_connects.load(Ordering::Relaxed),
            transport_lagged: self.transport_lagged.load(Ordering::Relaxed),
            site_switches: self.site_switches.load(Ordering::Relaxed),
            presence_records: self.presence_records.load(Ordering::Relaxed),
            presence_inside: self.presence_inside.load(Ordering::Relaxed),
            avg_apply_latency_us: if applied_interval > 0 {
                latency_sum / applied_interval
            } else {
                0
            },
            max_apply_latency_us: latency_max,
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub alerts_applied: u64,
    pub alerts_discarded: u64,
    pub alerts_per_sec: f64,
    pub occupancy_updates: u64,
    pub malformed_total: u64,
    pub unknown_direction_total: u64,
    pub invalidations_sent: u64,
    pub invalidations_dropped: u64,
    pub history_cache_hits: u64,
    pub history_fetches: u64,
    pub history_fetch_errors: u64,
    pub transport_connects: u64,
    pub transport_lagged: u64,
    pub site_switches: u64,
    pub presence_records: u64,
    pub presence_inside: u64,
    pub avg_apply_latency_us: u64,
    pub max_apply_latency_us: u64,
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            alerts_applied = %self.alerts_applied,
            alerts_discarded = %self.alerts_discarded,
            alerts_per_sec = format!("{:.1}", self.alerts_per_sec),
            malformed = %self.malformed_total,
            presence_records = %self.presence_records,
            presence_inside = %self.presence_inside,
            invalidations = %self.invalidations_sent,
            invalidations_dropped = %self.invalidations_dropped,
            history_fetches = %self.history_fetches,
            history_hits = %self.history_cache_hits,
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.alerts_applied(), 0);
        assert_eq!(metrics.malformed_total(), 0);
    }

    #[test]
    fn test_record_alert_applied() {
        let metrics = Metrics::new();
        metrics.record_alert_applied(15);
        metrics.record_alert_applied(300);
        assert_eq!(metrics.alerts_applied(), 2);
        assert_eq!(metrics.apply_latency_sum_us.load(Ordering::Relaxed), 315);
        assert_eq!(metrics.apply_latency_max_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(5), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(99_999), 10);
    }

    #[test]
    fn test_report_resets_interval_counters() {
        let metrics = Metrics::new();
        metrics.record_alert_applied(50);
        metrics.record_alert_discarded();
        metrics.record_malformed(true);

        let first = metrics.report();
        assert_eq!(first.alerts_applied, 1);
        assert_eq!(first.alerts_discarded, 1);
        assert_eq!(first.unknown_direction_total, 1);
        assert_eq!(first.avg_apply_latency_us, 50);
        assert_eq!(first.lat_buckets.iter().sum::<u64>(), 1);

        let second = metrics.report();
        assert_eq!(second.alerts_applied, 1, "monotonic counters survive report");
        assert_eq!(second.lat_buckets.iter().sum::<u64>(), 0);
        assert_eq!(second.max_apply_latency_us, 0);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 0);
        buckets[0] = 99;
        buckets[5] = 1;
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 10);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 10);
        assert_eq!(percentile_from_buckets(&buckets, 1.0), 320);
    }
}
