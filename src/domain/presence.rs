//! Visitor presence model and the event fold that maintains it
//!
//! `apply_event` is a pure function: it never touches its input map and always
//! returns a fresh one, so any snapshot handed out earlier stays exactly as it
//! was. Events are folded in arrival order; timestamps are data, not ordering.

use crate::domain::types::{SiteId, VisitEvent, VisitorId};
use rustc_hash::FxHashMap;
use serde::Serialize;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Current state of one visitor at the active site
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub visitor_id: VisitorId,
    pub visitor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Zone of the most recent entry (or of the bare exit that created the record)
    pub zone_id: String,
    pub zone_name: String,
    pub site_id: SiteId,
    pub site_name: String,
    pub entry_time: Option<i64>,
    pub exit_time: Option<i64>,
    /// Set only when an exit closes a known entry. May be negative if the
    /// exit's timestamp precedes the stored entry.
    pub dwell_minutes: Option<i64>,
}

impl PresenceRecord {
    fn from_event(event: &VisitEvent) -> Self {
        Self {
            visitor_id: event.visitor_id.clone(),
            visitor_name: event.visitor_name.clone(),
            gender: event.gender.clone(),
            zone_id: event.zone_id.clone(),
            zone_name: event.zone_name.clone(),
            site_id: event.site_id.clone(),
            site_name: event.site_name.clone(),
            entry_time: None,
            exit_time: None,
            dwell_minutes: None,
        }
    }

    /// Visitor has an entry with no exit after it
    pub fn is_inside(&self) -> bool {
        self.entry_time.is_some() && self.exit_time.is_none()
    }
}

/// Visitor identity to presence record, at most one record per visitor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceMap {
    records: FxHashMap<VisitorId, PresenceRecord>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, visitor_id: &VisitorId) -> Option<&PresenceRecord> {
        self.records.get(visitor_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Visitors currently inside (entered, not yet exited)
    pub fn inside_count(&self) -> usize {
        self.records.values().filter(|r| r.is_inside()).count()
    }

    /// List view for display, ordered by visitor id so output is stable
    pub fn to_list(&self) -> Vec<PresenceRecord> {
        let mut list: Vec<PresenceRecord> = self.records.values().cloned().collect();
        list.sort_by(|a, b| a.visitor_id.cmp(&b.visitor_id));
        list
    }
}

/// Whole minutes between entry and exit.
///
/// Uses `f64::round`, so exact half minutes round away from zero
/// (90s -> 2, -90s -> -2). `None` when the span does not fit in an `i64`.
#[inline]
pub fn dwell_minutes(entry_ms: i64, exit_ms: i64) -> Option<i64> {
    let span_ms = exit_ms.checked_sub(entry_ms)?;
    Some((span_ms as f64 / MS_PER_MINUTE).round() as i64)
}

/// Fold one event into a presence map for `active_site`.
///
/// Events for any other site leave the content unchanged.
pub fn apply_event(current: &PresenceMap, event: &VisitEvent, active_site: &SiteId) -> PresenceMap {
    let mut next = current.clone();
    if event.site_id != *active_site {
        return next;
    }

    let ts = event.timestamp;
    let existing = next.records.get_mut(&event.visitor_id);

    if event.direction.is_entry() {
        match existing {
            Some(record) => {
                // Re-entry supersedes any prior visit, open or closed
                record.zone_id = event.zone_id.clone();
                record.zone_name = event.zone_name.clone();
                record.entry_time = Some(ts);
                record.exit_time = None;
                record.dwell_minutes = None;
            }
            None => {
                let mut record = PresenceRecord::from_event(event);
                record.entry_time = Some(ts);
                next.records.insert(event.visitor_id.clone(), record);
            }
        }
    } else {
        match existing {
            Some(record) if record.entry_time.is_some() => {
                let entry = record.entry_time.unwrap_or(ts);
                record.exit_time = Some(ts);
                record.dwell_minutes = dwell_minutes(entry, ts);
            }
            _ => {
                // Exit with no open entry: a bare exit, dwell unknown
                let mut record = PresenceRecord::from_event(event);
                record.exit_time = Some(ts);
                next.records.insert(event.visitor_id.clone(), record);
            }
        }
    }

    next
}
