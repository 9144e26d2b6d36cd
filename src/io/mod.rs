//! IO modules - external system interfaces
//!
//! - `transport` - MQTT push-event connection with boundary parsing
//! - `analytics_api` - HTTP client for the analytics backend
//! - `http` - Read surface and Prometheus endpoint

pub mod analytics_api;
pub mod http;
pub mod transport;

pub use analytics_api::{AnalyticsClient, AnalyticsSource, ApiError};
pub use http::{start_http_server, HttpState};
pub use transport::{EventTransport, Subscription};
