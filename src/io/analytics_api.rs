//! HTTP client for the analytics backend
//!
//! All endpoints are `POST` with a JSON body and a bearer token. The backend
//! answers 401 when the session token has expired.

use crate::domain::history::{HistoryPage, HistoryRequest};
use crate::domain::types::SiteId;
use crate::infra::config::Config;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("session expired, login again")]
    Unauthorized,

    #[error("analytics API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("analytics request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Body shared by the aggregate endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRequest {
    pub site_id: SiteId,
    pub from_utc: i64,
    pub to_utc: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FootfallResponse {
    pub site_id: SiteId,
    #[serde(default)]
    pub from_utc: i64,
    #[serde(default)]
    pub to_utc: i64,
    pub footfall: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DemographicsRecord {
    #[serde(default)]
    person_id: String,
    #[serde(default)]
    gender: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DemographicsResponse {
    #[serde(default)]
    records: Option<Vec<DemographicsRecord>>,
}

/// Person id to gender, as far as today's demographics know
pub type GenderMap = FxHashMap<String, String>;

/// Read side of the analytics backend used by the history cache and refresher
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn fetch_history(&self, request: &HistoryRequest) -> Result<HistoryPage, ApiError>;

    async fn fetch_gender_map(&self, range: &RangeRequest) -> Result<GenderMap, ApiError>;

    async fn fetch_footfall(&self, range: &RangeRequest) -> Result<FootfallResponse, ApiError>;
}

/// reqwest-backed analytics client
pub struct AnalyticsClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl AnalyticsClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        // Reuse one client for connection pooling
        let http = reqwest::Client::builder().timeout(config.api_timeout()).build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url().to_string(),
            token: config.api_token().map(str::to_string),
        })
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(endpoint = %endpoint, "analytics_unauthorized");
            return Err(ApiError::Unauthorized);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status: status.as_u16(), message: error_message(&text) });
        }

        debug!(endpoint = %endpoint, status = %status.as_u16(), "analytics_response");
        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl AnalyticsSource for AnalyticsClient {
    async fn fetch_history(&self, request: &HistoryRequest) -> Result<HistoryPage, ApiError> {
        self.post("/analytics/entry-exit", request).await
    }

    async fn fetch_gender_map(&self, range: &RangeRequest) -> Result<GenderMap, ApiError> {
        let response: DemographicsResponse = self.post("/analytics/demographics", range).await?;
        Ok(gender_map_from_records(response.records.unwrap_or_default()))
    }

    async fn fetch_footfall(&self, range: &RangeRequest) -> Result<FootfallResponse, ApiError> {
        self.post("/analytics/footfall", range).await
    }
}

fn gender_map_from_records(records: Vec<DemographicsRecord>) -> GenderMap {
    records
        .into_iter()
        .filter_map(|r| match r.gender {
            Some(g) if !r.person_id.is_empty() && !g.is_empty() => Some((r.person_id, g)),
            _ => None,
        })
        .collect()
}

/// Best human-readable message from an error body: `message`, then `error`,
/// then the raw text.
pub fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { message: Some(m), .. }) if !m.is_empty() => m,
        Ok(ErrorBody { error: Some(e), .. }) if !e.is_empty() => e,
        _ => body.to_string(),
    }
}
