//! API request and response models.

use argus_core::{Settings, StatsUpdate};
use serde::{Deserialize, Serialize};

/// Default number of entries returned by GET /api/traffic-logs.
pub const DEFAULT_LOGS_LIMIT: i64 = 100;

/// Upper bound on GET /api/traffic-logs.
pub const MAX_LOGS_LIMIT: i64 = 1000;

/// Query parameters for GET /api/traffic-logs.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Maximum number of entries to return (default: 100).
    pub limit: Option<i64>,
}

impl LogsQuery {
    /// The requested limit clamped to `1..=MAX_LOGS_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LOGS_LIMIT)
            .clamp(1, MAX_LOGS_LIMIT) as usize
    }
}

/// Request body for POST /api/rules/domains.
#[derive(Debug, Deserialize)]
pub struct AddDomainRequest {
    #[serde(default)]
    pub domain: Option<String>,
}

/// Request body for POST /api/rules/keywords.
#[derive(Debug, Deserialize)]
pub struct AddKeywordRequest {
    #[serde(default)]
    pub keyword: Option<String>,
}

/// Request body for POST /api/settings.
#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    #[serde(default)]
    pub filtering_enabled: Option<bool>,
}

/// Plain acknowledgement.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Response body for POST /api/settings.
#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub message: String,
    pub settings: Settings,
}

/// Response body for DELETE /api/traffic-logs.
#[derive(Debug, Serialize)]
pub struct ClearLogsResponse {
    pub message: String,
    pub deleted: usize,
}

/// Body returned by GET /api/traffic-detail/{id} when the id is unknown.
#[derive(Debug, Serialize)]
pub struct DetailMissResponse {
    pub error: String,
}

/// Response body for GET /api/health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Frame pushed to WebSocket subscribers.
#[derive(Debug, Serialize)]
pub struct StatsEvent<'a> {
    pub event: &'static str,
    pub data: &'a StatsUpdate,
}

impl<'a> StatsEvent<'a> {
    pub fn stats_update(data: &'a StatsUpdate) -> Self {
        Self {
            event: "stats_update",
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_limit_defaults_and_clamps() {
        assert_eq!(LogsQuery::default().effective_limit(), 100);
        assert_eq!(LogsQuery { limit: Some(0) }.effective_limit(), 1);
        assert_eq!(LogsQuery { limit: Some(-5) }.effective_limit(), 1);
        assert_eq!(LogsQuery { limit: Some(25) }.effective_limit(), 25);
        assert_eq!(LogsQuery { limit: Some(50_000) }.effective_limit(), 1000);
    }
}
