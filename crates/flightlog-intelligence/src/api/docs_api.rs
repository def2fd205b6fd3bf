//! Documentation index management endpoints.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::docs::DocIndexStatus;
use crate::error::ServiceError;
use crate::shared_state::AppState;

/// GET /chatbot/docs/status
pub async fn docs_status(State(state): State<AppState>) -> Json<DocIndexStatus> {
    Json(state.docs.status().await)
}

/// POST /chatbot/docs/refresh — re-fetch the source and re-embed when its
/// content changed.
pub async fn docs_refresh(
    State(state): State<AppState>,
) -> Result<Json<DocIndexStatus>, ServiceError> {
    info!("Documentation refresh requested");
    state
        .docs
        .refresh()
        .await
        .map_err(ServiceError::Transport)?;
    Ok(Json(state.docs.status().await))
}

/// POST /chatbot/docs/clear-cache — purge the persistent embedding cache.
pub async fn docs_clear_cache(State(state): State<AppState>) -> Result<Json<Value>, ServiceError> {
    info!("Documentation cache purge requested");
    state.docs.clear_cache().await?;
    Ok(Json(json!({
        "success": true,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}
