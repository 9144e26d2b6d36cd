//! Staleness signals from the live event path to the history cache
//!
//! Sending never blocks and never retries. If the channel is full or the cache
//! worker is gone, the signal is dropped and counted; the next poll refreshes
//! the page anyway.

use crate::domain::types::SiteId;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// "The `(entries, site_id)` result set is stale"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub site_id: SiteId,
}

/// Sender handle for staleness signals. Clone to share across producers.
#[derive(Clone)]
pub struct InvalidationSender {
    tx: mpsc::Sender<Invalidation>,
    metrics: Arc<Metrics>,
}

impl InvalidationSender {
    pub fn new(tx: mpsc::Sender<Invalidation>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    /// Fire-and-forget. Returns whether the signal was queued.
    pub fn invalidate(&self, site_id: &SiteId) -> bool {
        match self.tx.try_send(Invalidation { site_id: site_id.clone() }) {
            Ok(()) => {
                self.metrics.record_invalidation_sent();
                true
            }
            Err(e) => {
                self.metrics.record_invalidation_dropped();
                debug!(site_id = %site_id, error = %e, "invalidation_dropped");
                false
            }
        }
    }
}

/// Create a new invalidation channel pair
pub fn create_invalidation_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (InvalidationSender, mpsc::Receiver<Invalidation>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (InvalidationSender::new(tx, metrics), rx)
}
