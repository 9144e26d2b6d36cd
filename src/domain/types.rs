//! Shared types for the presence gateway
//!
//! Wire messages arrive as loosely-typed JSON. They are validated once, at the
//! transport boundary, into the typed events below; nothing downstream sees the
//! raw payloads.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Newtype wrapper for visitor identities
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitorId(pub String);

impl std::fmt::Display for VisitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VisitorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for site identities
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Why an inbound message could not be turned into a typed event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEvent {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("unknown direction `{0}`")]
    UnknownDirection(String),

    #[error("unknown severity `{0}`")]
    UnknownSeverity(String),

    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
}

impl MalformedEvent {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            MalformedEvent::InvalidUtf8 => "invalid_utf8",
            MalformedEvent::InvalidJson(_) => "invalid_json",
            MalformedEvent::MissingField(_) => "missing_field",
            MalformedEvent::UnknownDirection(_) => "unknown_direction",
            MalformedEvent::UnknownSeverity(_) => "unknown_severity",
            MalformedEvent::UnknownChannel(_) => "unknown_channel",
        }
    }
}

/// Movement direction carried by an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Entry,
    Exit,
    ZoneEntry,
    ZoneExit,
}

impl FromStr for Direction {
    type Err = MalformedEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(Direction::Entry),
            "exit" => Ok(Direction::Exit),
            "zone-entry" => Ok(Direction::ZoneEntry),
            "zone-exit" => Ok(Direction::ZoneExit),
            other => Err(MalformedEvent::UnknownDirection(other.to_string())),
        }
    }
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entry => "entry",
            Direction::Exit => "exit",
            Direction::ZoneEntry => "zone-entry",
            Direction::ZoneExit => "zone-exit",
        }
    }

    /// `entry` and `zone-entry`
    #[inline]
    pub fn is_entry(&self) -> bool {
        matches!(self, Direction::Entry | Direction::ZoneEntry)
    }
}

/// Alert severity as assigned by the analytics backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl FromStr for Severity {
    type Err = MalformedEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(MalformedEvent::UnknownSeverity(other.to_string())),
        }
    }
}

/// A validated entry/exit alert
#[derive(Debug, Clone, PartialEq)]
pub struct VisitEvent {
    /// Sender-assigned epoch milliseconds
    pub timestamp: i64,
    pub event_id: String,
    pub direction: Direction,
    pub visitor_id: VisitorId,
    pub visitor_name: String,
    pub gender: Option<String>,
    pub zone_id: String,
    pub zone_name: String,
    pub site_id: SiteId,
    pub site_name: String,
    pub severity: Severity,
}

/// A validated occupancy update
#[derive(Debug, Clone, PartialEq)]
pub struct LiveOccupancyEvent {
    pub timestamp: i64,
    pub site_id: SiteId,
    pub site_occupancy: i64,
    pub zone_id: String,
    pub zone_occupancy: i64,
}

/// Everything the transport can deliver to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Alert(VisitEvent),
    LiveOccupancy(LiveOccupancyEvent),
}

/// Raw `alert` payload. Every field is optional so that absence can be
/// reported by name instead of as a generic decode failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub ts: Option<i64>,
    pub event_id: Option<String>,
    pub direction: Option<String>,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    pub gender: Option<String>,
    pub zone_id: Option<String>,
    pub zone_name: Option<String>,
    pub site_id: Option<String>,
    pub site_name: Option<String>,
    pub severity: Option<String>,
}

impl TryFrom<AlertMessage> for VisitEvent {
    type Error = MalformedEvent;

    fn try_from(msg: AlertMessage) -> Result<Self, Self::Error> {
        let timestamp = msg.ts.ok_or(MalformedEvent::MissingField("ts"))?;
        let direction: Direction =
            msg.direction.ok_or(MalformedEvent::MissingField("direction"))?.parse()?;
        let visitor_id = msg.person_id.ok_or(MalformedEvent::MissingField("personId"))?;
        if visitor_id.is_empty() {
            return Err(MalformedEvent::MissingField("personId"));
        }
        let site_id = msg.site_id.ok_or(MalformedEvent::MissingField("siteId"))?;
        // Severity is descriptive only; absent means low
        let severity = match msg.severity {
            Some(s) => s.parse()?,
            None => Severity::Low,
        };

        Ok(VisitEvent {
            timestamp,
            event_id: msg.event_id.unwrap_or_default(),
            direction,
            visitor_id: VisitorId(visitor_id),
            visitor_name: msg.person_name.unwrap_or_default(),
            gender: msg.gender,
            zone_id: msg.zone_id.unwrap_or_default(),
            zone_name: msg.zone_name.unwrap_or_default(),
            site_id: SiteId(site_id),
            site_name: msg.site_name.unwrap_or_default(),
            severity,
        })
    }
}

/// Raw `live_occupancy` payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveOccupancyMessage {
    pub ts: Option<i64>,
    pub site_id: Option<String>,
    pub site_occupancy: Option<i64>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub zone_occupancy: Option<i64>,
}

impl TryFrom<LiveOccupancyMessage> for LiveOccupancyEvent {
    type Error = MalformedEvent;

    fn try_from(msg: LiveOccupancyMessage) -> Result<Self, Self::Error> {
        Ok(LiveOccupancyEvent {
            timestamp: msg.ts.ok_or(MalformedEvent::MissingField("ts"))?,
            site_id: SiteId(msg.site_id.ok_or(MalformedEvent::MissingField("siteId"))?),
            site_occupancy: msg
                .site_occupancy
                .ok_or(MalformedEvent::MissingField("siteOccupancy"))?,
            zone_id: msg.zone_id.unwrap_or_default(),
            zone_occupancy: msg.zone_occupancy.unwrap_or_default(),
        })
    }
}
