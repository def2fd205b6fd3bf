//! Session initialization and the chat turn endpoint.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::error::ServiceError;
use crate::metrics;
use crate::safety::AnswerCategory;
use crate::shared_state::AppState;
use crate::tabular::IngestSummary;
use crate::tools::schema_json;
use crate::validator::ValidationReport;

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    #[serde(rename = "logData")]
    pub log_data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub session_id: String,
    pub timestamp: String,
    pub ingest_summary: IngestSummary,
}

/// POST /chatbot/init — ingest a parsed log and open a session.
pub async fn init_session(
    State(state): State<AppState>,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>, ServiceError> {
    let log_data = req
        .log_data
        .ok_or_else(|| ServiceError::Input("logData is required".into()))?;

    match state.registry.create(&log_data) {
        Ok((session_id, ingest_summary)) => {
            metrics::inc_request("/chatbot/init", "ok");
            Ok(Json(InitResponse {
                session_id,
                timestamp: Utc::now().to_rfc3339(),
                ingest_summary,
            }))
        }
        Err(e) => {
            metrics::inc_request("/chatbot/init", "error");
            error!("Log ingestion failed: {:#}", e);
            Err(ServiceError::Ingest(e.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,
    pub thinking: String,
    pub relevant_docs: Vec<crate::docs::ScoredChunk>,
    pub data_schema: Value,
    pub available_tables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_category: Option<AnswerCategory>,
    pub timestamp: String,
}

/// POST /chatbot/chat — run one agent turn on an existing session.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ServiceError> {
    let message = req
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ServiceError::Input("message is required".into()))?;
    let session_id = req
        .session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::Input("sessionId is required".into()))?;

    let session_arc = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ServiceError::SessionExpired(session_id.clone()))?;

    // Holding the lock for the whole turn serializes turns per session.
    let mut session = session_arc.lock().await;

    let started = Instant::now();
    let deadline = Duration::from_secs(state.config.turn_deadline_seconds);
    let output = match tokio::time::timeout(
        deadline,
        state.controller.run_turn(&mut session, &message),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            metrics::inc_request("/chatbot/chat", "error");
            return Err(ServiceError::Transport(e));
        }
        Err(_) => {
            metrics::inc_request("/chatbot/chat", "timeout");
            return Err(ServiceError::Transport(anyhow::anyhow!(
                "turn deadline of {}s exceeded",
                state.config.turn_deadline_seconds
            )));
        }
    };
    metrics::observe_turn_duration(started.elapsed().as_secs_f64());
    metrics::inc_request("/chatbot/chat", "ok");

    info!(
        "Chat turn on session {} finished in {:.2}s ({} round trips)",
        session_id,
        started.elapsed().as_secs_f64(),
        output.llm_round_trips
    );

    Ok(Json(ChatResponse {
        response: output.response,
        thinking: output.thinking,
        relevant_docs: output.relevant_docs,
        data_schema: schema_json(&session.schema),
        available_tables: session.schema.values().map(|t| t.table.clone()).collect(),
        query_validation: output.validation,
        answer_category: output.answer_category,
        timestamp: Utc::now().to_rfc3339(),
    }))
}
