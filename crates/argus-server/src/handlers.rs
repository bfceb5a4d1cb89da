//! API route handlers.

use argus_core::{RuleKind, StatsUpdate, TrafficSummary, DEFAULT_RANGE_HOURS};
use argus_storage::{RuleListing, StorageError};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{ApiError, Result};
use crate::models::{
    AddDomainRequest, AddKeywordRequest, ClearLogsResponse, DetailMissResponse, HealthResponse,
    LogsQuery, MessageResponse, SettingsRequest, SettingsResponse,
};
use crate::state::AppState;

/// File name offered when downloading the root certificate.
pub const CERTIFICATE_FILENAME: &str = "argus-ca.crt";

/// Runs a synchronous storage call on the blocking pool.
///
/// The outer error is a failed task; the inner one is left to the caller.
async fn blocking<T, F>(f: F) -> Result<std::result::Result<T, StorageError>>
where
    F: FnOnce() -> std::result::Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("storage task failed: {}", e)))
}

/// GET /api/health - Liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/statistics - Totals, recent traffic and the last 24 hourly buckets.
pub async fn get_statistics(State(state): State<AppState>) -> Result<Json<StatsUpdate>> {
    let db = state.db.clone();
    let snapshot = blocking(move || db.stats_snapshot(DEFAULT_RANGE_HOURS, Utc::now())).await??;
    Ok(Json(snapshot))
}

/// GET /api/traffic-logs - Newest entries first, without headers or bodies.
pub async fn get_traffic_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<TrafficSummary>>> {
    let limit = query.effective_limit();
    debug!(limit, "Listing traffic logs");
    let db = state.db.clone();
    Ok(Json(blocking(move || db.recent_traffic(limit)).await??))
}

/// DELETE /api/traffic-logs - Clears the log and its hourly statistics.
pub async fn clear_traffic_logs(State(state): State<AppState>) -> Result<Json<ClearLogsResponse>> {
    let db = state.db.clone();
    let deleted = blocking(move || db.clear_traffic()).await??;
    info!(deleted, "Traffic log cleared");
    Ok(Json(ClearLogsResponse {
        message: format!("Deleted {} traffic log entries", deleted),
        deleted,
    }))
}

/// GET /api/traffic-detail/{id} - Full entry.
///
/// An unknown id answers 200 with an `error` field, which is what the
/// dashboard expects.
pub async fn get_traffic_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response> {
    let db = state.db.clone();
    match blocking(move || db.get_traffic_entry(id)).await? {
        Ok(entry) => Ok(Json(entry).into_response()),
        Err(StorageError::NotFound(_)) => Ok(Json(DetailMissResponse {
            error: format!("Traffic log entry {} not found", id),
        })
        .into_response()),
        Err(e) => Err(e.into()),
    }
}

/// GET /api/rules - Domains, keywords and settings.
pub async fn get_rules(State(state): State<AppState>) -> Json<RuleListing> {
    Json(state.rules.list_rules())
}

/// GET /api/rules/domains - Blocked domains.
pub async fn get_domains(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.rules.list_rules().domains)
}

/// GET /api/rules/keywords - Blocked keywords.
pub async fn get_keywords(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.rules.list_rules().keywords)
}

/// POST /api/rules/domains - Adds a blocked domain.
pub async fn add_domain(
    State(state): State<AppState>,
    Json(req): Json<AddDomainRequest>,
) -> Result<(StatusCode, Json<MessageResponse>)> {
    let rules = state.rules.clone();
    let domain = req.domain.unwrap_or_default();
    let rule = blocking(move || rules.add_domain(&domain)).await??;
    info!(domain = %rule.value, "Domain rule added");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new(format!("Added domain rule: {}", rule.value))),
    ))
}

/// POST /api/rules/keywords - Adds a blocked keyword.
pub async fn add_keyword(
    State(state): State<AppState>,
    Json(req): Json<AddKeywordRequest>,
) -> Result<(StatusCode, Json<MessageResponse>)> {
    let rules = state.rules.clone();
    let keyword = req.keyword.unwrap_or_default();
    let rule = blocking(move || rules.add_keyword(&keyword)).await??;
    info!(keyword = %rule.value, "Keyword rule added");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new(format!("Added keyword rule: {}", rule.value))),
    ))
}

/// DELETE /api/rules/{kind}/{value} - Removes a rule; `kind` is `domains` or `keywords`.
pub async fn delete_rule(
    State(state): State<AppState>,
    Path((kind, value)): Path<(String, String)>,
) -> Result<Json<MessageResponse>> {
    let kind = RuleKind::from_plural(&kind)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown rule kind: {}", kind)))?;

    let rules = state.rules.clone();
    let rule = blocking(move || rules.remove_rule(kind, &value)).await??;
    info!(kind = %rule.kind, value = %rule.value, "Rule removed");
    Ok(Json(MessageResponse::new(format!(
        "Removed {} rule: {}",
        rule.kind, rule.value
    ))))
}

/// POST /api/settings - Toggles filtering.
pub async fn update_settings(
    State(state): State<AppState>,
    Json(req): Json<SettingsRequest>,
) -> Result<Json<SettingsResponse>> {
    let enabled = req
        .filtering_enabled
        .ok_or_else(|| ApiError::BadRequest("filtering_enabled is required".to_string()))?;

    let rules = state.rules.clone();
    let settings = blocking(move || rules.set_filtering_enabled(enabled)).await??;
    info!(filtering_enabled = enabled, "Settings updated");
    Ok(Json(SettingsResponse {
        message: "Settings updated".to_string(),
        settings,
    }))
}

/// GET /api/certificate - Root CA certificate in PEM form.
pub async fn get_certificate(State(state): State<AppState>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/x-x509-ca-cert".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", CERTIFICATE_FILENAME),
            ),
        ],
        state.ca.root_certificate_pem().to_string(),
    )
}
