//! Composition root: wires the singletons and serves the HTTP API.
//!
//! Initialization order matters: telemetry and metrics first, then the
//! gateway, doc index (with its cache warm-up), registry and controller,
//! and only then does the listener accept traffic. On shutdown the doc
//! cache is flushed to disk.

use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::AgentController;
use crate::config::Config;
use crate::docs::{DocIndex, DocsCache};
use crate::llm::{ChatBackend, LlmGateway};
use crate::session::SessionRegistry;
use crate::shared_state::AppState;

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing(&cfg.log_level);
    crate::metrics::init_metrics();
    cfg.print_config();

    let config = Arc::new(cfg);

    let gateway: Arc<dyn ChatBackend> = Arc::new(LlmGateway::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.llm_timeout_seconds,
        config.llm_max_retries,
    ));

    let docs = Arc::new(DocIndex::new(
        gateway.clone(),
        config.embed_model.clone(),
        DocsCache::new(&config.cache_dir),
        config.doc_source_url.clone(),
        config.llm_timeout_seconds,
    ));
    if let Err(e) = docs.initialize().await {
        warn!("Doc index initialization failed, retrieval degraded: {:#}", e);
    }

    let registry = Arc::new(SessionRegistry::new(config.session_ttl_seconds));

    let controller = Arc::new(AgentController::new(
        gateway,
        docs.clone(),
        config.chat_model.clone(),
        config.parser_model.clone(),
    ));

    let state = AppState::new(config.clone(), registry, docs.clone(), controller);

    let addr = config.api_addr();
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, flushing doc cache");
    if let Err(e) = docs.persist().await {
        warn!("Doc cache flush failed: {:#}", e);
    }

    Ok(())
}

fn build_router(state: AppState) -> axum::Router {
    use axum::{
        routing::{get, post},
        Router,
    };
    use std::time::Duration;
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    // The router-level timeout sits above the per-turn deadline so the
    // controller's own deadline fires first.
    let request_timeout = Duration::from_secs(state.config.turn_deadline_seconds + 30);

    Router::new()
        .route("/chatbot/init", post(crate::api::chat_api::init_session))
        .route("/chatbot/chat", post(crate::api::chat_api::chat))
        .route(
            "/chatbot/sessions/stats",
            get(crate::api::session_api::session_stats),
        )
        .route(
            "/chatbot/sessions/:id/validate",
            get(crate::api::session_api::validate_session),
        )
        .route(
            "/chatbot/sessions/:id/schema",
            get(crate::api::session_api::get_schema),
        )
        .route(
            "/chatbot/sessions/:id/query",
            post(crate::api::session_api::debug_query),
        )
        .route(
            "/chatbot/sessions/:id/validation-history",
            get(crate::api::session_api::validation_history),
        )
        .route("/chatbot/docs/status", get(crate::api::docs_api::docs_status))
        .route(
            "/chatbot/docs/refresh",
            post(crate::api::docs_api::docs_refresh),
        )
        .route(
            "/chatbot/docs/clear-cache",
            post(crate::api::docs_api::docs_clear_cache),
        )
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install shutdown handler: {}", e);
    }
}
