//! Session introspection and debugging endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::ServiceError;
use crate::session::RecordedValidation;
use crate::shared_state::AppState;
use crate::tools::schema_json;
use crate::utils::text_utils::TextUtils;

/// GET /chatbot/sessions/:id/validate — 200 when the session is live.
pub async fn validate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registry.get(&session_id) {
        Some(_) => Json(json!({ "valid": true, "sessionId": session_id })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "valid": false, "sessionId": session_id })),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub session_id: String,
    pub data_schema: Value,
    pub available_tables: Vec<String>,
    pub timestamp: String,
}

/// GET /chatbot/sessions/:id/schema
pub async fn get_schema(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SchemaResponse>, ServiceError> {
    let session_arc = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ServiceError::SessionExpired(session_id.clone()))?;
    let session = session_arc.lock().await;

    Ok(Json(SchemaResponse {
        session_id,
        data_schema: schema_json(&session.schema),
        available_tables: session.schema.values().map(|t| t.table.clone()).collect(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DebugQueryRequest {
    pub sql: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugQueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

/// POST /chatbot/sessions/:id/query — read-only debugging queries.
pub async fn debug_query(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<DebugQueryRequest>,
) -> Result<Json<DebugQueryResponse>, ServiceError> {
    let sql = req
        .sql
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ServiceError::Input("sql is required".into()))?;

    let session_arc = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ServiceError::SessionExpired(session_id.clone()))?;
    let session = session_arc.lock().await;

    info!(
        "Debug query on session {}: {}",
        session_id,
        TextUtils::truncate_with_ellipsis(&sql, 200)
    );
    let result = session
        .store
        .query(&sql)
        .map_err(|e| ServiceError::Input(e.to_string()))?;

    Ok(Json(DebugQueryResponse {
        columns: result.columns.clone(),
        rows: result
            .rows
            .iter()
            .map(|row| row.iter().map(|cell| cell.to_json()).collect())
            .collect(),
        row_count: result.rows.len(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationHistoryResponse {
    pub session_id: String,
    pub validations: Vec<RecordedValidation>,
}

/// GET /chatbot/sessions/:id/validation-history
pub async fn validation_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ValidationHistoryResponse>, ServiceError> {
    let session_arc = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ServiceError::SessionExpired(session_id.clone()))?;
    let session = session_arc.lock().await;

    Ok(Json(ValidationHistoryResponse {
        session_id,
        validations: session.validation_history.clone(),
    }))
}

/// GET /chatbot/sessions/stats — registry aggregates.
pub async fn session_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.registry.stats();
    Json(json!({
        "stats": stats,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
