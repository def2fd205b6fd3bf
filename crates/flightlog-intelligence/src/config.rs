use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

/// Trailing conversation window kept per session.
pub const HISTORY_WINDOW: usize = 20;
/// Documentation chunks returned per retrieval query.
pub const DOC_TOP_K: usize = 3;
/// Character budget for a single documentation chunk.
pub const CHUNK_CHAR_BUDGET: usize = 1000;
/// Maximum tool-call rounds within one turn.
pub const TOOL_HOP_LIMIT: usize = 4;
/// Correction budget for query discrepancies.
pub const QUERY_CORRECTION_BUDGET: usize = 1;
/// Correction budget for answer-shape rejections.
pub const ANSWER_CORRECTION_BUDGET: usize = 2;
/// Cached doc embeddings older than this are re-embedded.
pub const DOC_CACHE_MAX_AGE_DAYS: i64 = 30;
/// Validation records retained per session.
pub const VALIDATION_HISTORY_LIMIT: usize = 50;

const DEFAULT_DOC_SOURCE_URL: &str =
    "https://ardupilot.org/copter/docs/logmessages.html";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub port: u16,
    pub log_level: String,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub chat_model: String,
    pub parser_model: String,
    pub embed_model: String,
    pub session_ttl_seconds: u64,
    pub cache_dir: PathBuf,
    pub doc_source_url: String,
    pub llm_timeout_seconds: u64,
    pub turn_deadline_seconds: u64,
    pub llm_max_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let llm_api_key = env::var("LLM_API_KEY")
            .context("LLM_API_KEY environment variable not set. Please set it in your .env file")?;

        let llm_base_url = env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com".into());
        let llm_base_url = llm_base_url.trim_end_matches('/').to_string();

        Ok(Self {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT").unwrap_or_else(|_| "8001".into()).parse()?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            llm_api_key,
            llm_base_url,
            chat_model: env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            parser_model: env::var("LLM_PARSER_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            embed_model: env::var("LLM_EMBED_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".into()),
            session_ttl_seconds: env::var("SESSION_TTL_SECONDS")
                .unwrap_or_else(|_| "86400".into())
                .parse()?,
            cache_dir: PathBuf::from(
                env::var("CACHE_DIR").unwrap_or_else(|_| "./data/cache".into()),
            ),
            doc_source_url: env::var("DOC_SOURCE_URL")
                .unwrap_or_else(|_| DEFAULT_DOC_SOURCE_URL.into()),
            llm_timeout_seconds: env::var("LLM_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "60".into())
                .parse()?,
            turn_deadline_seconds: env::var("TURN_DEADLINE_SECONDS")
                .unwrap_or_else(|_| "120".into())
                .parse()?,
            llm_max_retries: env::var("LLM_MAX_RETRIES")
                .unwrap_or_else(|_| "3".into())
                .parse()?,
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.port);
        info!("- Log Level: {}", self.log_level);
        info!("- LLM Base URL: {}", self.llm_base_url);
        info!("- Chat Model: {}", self.chat_model);
        info!("- Parser Model: {}", self.parser_model);
        info!("- Embed Model: {}", self.embed_model);
        info!("- Session TTL: {}s", self.session_ttl_seconds);
        info!("- Cache Dir: {}", self.cache_dir.display());
        info!("- Doc Source: {}", self.doc_source_url);
        info!("- LLM Timeout: {}s", self.llm_timeout_seconds);
        info!("- Turn Deadline: {}s", self.turn_deadline_seconds);
    }

    pub fn api_addr(&self) -> SocketAddr {
        format!("{}:{}", self.api_host, self.port)
            .parse()
            .expect("invalid API_HOST/PORT combination")
    }
}
