//! Domain models - typed events, presence records and history pages
//!
//! - `types` - Visit/occupancy events and their boundary validation
//! - `presence` - `PresenceRecord`, `PresenceMap` and the `apply_event` fold
//! - `history` - Paginated visit history shapes from the analytics API
//! - `time` - Epoch-millisecond range helpers

pub mod history;
pub mod presence;
pub mod time;
pub mod types;

pub use presence::{apply_event, PresenceMap, PresenceRecord};
pub use types::{
    Direction, LiveOccupancyEvent, MalformedEvent, Severity, SiteId, TransportEvent, VisitEvent,
    VisitorId,
};
