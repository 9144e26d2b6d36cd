//! Paginated visit history as served by the analytics API

use crate::domain::types::SiteId;
use serde::{Deserialize, Serialize};

/// Cache key for one page of visit history
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub site_id: SiteId,
    pub page: u32,
    pub page_size: u32,
}

impl HistoryKey {
    pub fn new(site_id: SiteId, page: u32, page_size: u32) -> Self {
        Self { site_id, page, page_size }
    }
}

/// Request body for `/analytics/entry-exit`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub site_id: SiteId,
    pub from_utc: i64,
    pub to_utc: i64,
    pub page_number: u32,
    pub page_size: u32,
}

/// One closed (or still open) visit as recorded by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub person_id: String,
    #[serde(default)]
    pub person_name: String,
    #[serde(default)]
    pub zone_id: String,
    #[serde(default)]
    pub zone_name: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub entry_utc: Option<i64>,
    #[serde(default)]
    pub entry_local: Option<String>,
    #[serde(default)]
    pub exit_utc: Option<i64>,
    #[serde(default)]
    pub exit_local: Option<String>,
    #[serde(default)]
    pub dwell_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

/// Response body for `/analytics/entry-exit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub site_id: SiteId,
    pub total_records: u64,
    pub total_pages: u32,
    pub page_number: u32,
    pub page_size: u32,
    #[serde(default)]
    pub records: Vec<HistoryRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_history_page() {
        let json = r#"{
            "siteId": "S1",
            "totalRecords": 51,
            "totalPages": 3,
            "pageNumber": 1,
            "pageSize": 25,
            "records": [{
                "personId": "P1",
                "personName": "Ada",
                "zoneId": "Z1",
                "zoneName": "Lobby",
                "severity": "low",
                "entryUtc": 1000,
                "entryLocal": "09:00",
                "exitUtc": 301000,
                "exitLocal": "09:05",
                "dwellMinutes": 5
            }]
        }"#;

        let page: HistoryPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.site_id, SiteId::from("S1"));
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].dwell_minutes, Some(5.0));
        assert_eq!(page.records[0].gender, None);
    }

    #[test]
    fn test_request_uses_camel_case() {
        let req = HistoryRequest {
            site_id: SiteId::from("S1"),
            from_utc: 1,
            to_utc: 2,
            page_number: 1,
            page_size: 25,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["siteId"], "S1");
        assert_eq!(json["pageNumber"], 1);
        assert_eq!(json["fromUtc"], 1);
    }
}
