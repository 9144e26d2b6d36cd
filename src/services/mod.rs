//! Services - presence state and the caches around it
//!
//! - `reconciler` - Folds alerts into the active site's presence map
//! - `live_counters` - Footfall and occupancy overlay
//! - `invalidation` - Fire-and-forget staleness signals
//! - `history_cache` - Paginated visit history query cache
//! - `history_poller` - Periodic refresh of the active site's history

pub mod history_cache;
pub mod history_poller;
pub mod invalidation;
pub mod live_counters;
pub mod reconciler;

pub use history_cache::HistoryCache;
pub use history_poller::HistoryPoller;
pub use invalidation::{create_invalidation_channel, Invalidation, InvalidationSender};
pub use live_counters::{LiveCounters, SiteCounters};
pub use reconciler::{PresenceReconciler, PresenceSnapshot};
