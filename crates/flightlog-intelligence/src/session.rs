//! Process-local session registry.
//!
//! A session binds an opaque id to a log's derived tables, a bounded
//! conversation history, and recent validation records. Turns on one
//! session serialize by locking the session for the whole turn; the
//! registry itself only mutates on create, touch and evict.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{HISTORY_WINDOW, VALIDATION_HISTORY_LIMIT};
use crate::metrics;
use crate::tabular::{ingest_log, IngestSummary, SchemaMap, TabularStore};
use crate::validator::ValidationReport;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub role: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedValidation {
    pub timestamp: DateTime<Utc>,
    pub report: ValidationReport,
}

pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub store: Arc<TabularStore>,
    pub schema: SchemaMap,
    pub ingest_summary: IngestSummary,
    pub history: Vec<ConversationTurn>,
    pub message_count: usize,
    pub validation_history: Vec<RecordedValidation>,
}

impl Session {
    /// Append the turn's (user, assistant) pair, keeping the trailing
    /// window. Called exactly once per emitted turn.
    pub fn append_turn(&mut self, user_text: &str, assistant_text: &str) {
        let now = Utc::now();
        self.history.push(ConversationTurn {
            role: "user".into(),
            text: user_text.to_string(),
            timestamp: now,
        });
        self.history.push(ConversationTurn {
            role: "assistant".into(),
            text: assistant_text.to_string(),
            timestamp: now,
        });
        self.message_count += 2;
        if self.history.len() > HISTORY_WINDOW {
            let excess = self.history.len() - HISTORY_WINDOW;
            self.history.drain(..excess);
        }
    }

    pub fn record_validation(&mut self, report: ValidationReport) {
        self.validation_history.push(RecordedValidation {
            timestamp: Utc::now(),
            report,
        });
        if self.validation_history.len() > VALIDATION_HISTORY_LIMIT {
            let excess = self.validation_history.len() - VALIDATION_HISTORY_LIMIT;
            self.validation_history.drain(..excess);
        }
    }
}

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    created_at: DateTime<Utc>,
    /// Unix seconds; atomic so touches never contend with an in-flight turn.
    last_access: AtomicI64,
}

impl SessionEntry {
    fn touch(&self) {
        self.last_access.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn expired(&self, now: DateTime<Utc>, ttl_seconds: i64) -> bool {
        now.timestamp() - self.last_access.load(Ordering::Relaxed) > ttl_seconds
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_messages: usize,
    pub total_tables: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    ttl_seconds: i64,
}

impl SessionRegistry {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_seconds: ttl_seconds as i64,
        }
    }

    /// Ingest a parsed log into a fresh session and return its id along
    /// with the ingest summary.
    pub fn create(&self, log: &serde_json::Value) -> Result<(String, IngestSummary)> {
        let store = Arc::new(TabularStore::new()?);
        let (schema, summary) = ingest_log(&store, log)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            created_at: now,
            store,
            schema,
            ingest_summary: summary.clone(),
            history: Vec::new(),
            message_count: 0,
            validation_history: Vec::new(),
        };
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                created_at: now,
                last_access: AtomicI64::new(now.timestamp()),
            },
        );
        metrics::inc_sessions();
        info!(
            "Session {} created ({} tables, {} skipped, {} failed)",
            id,
            summary.tables_created,
            summary.skipped.len(),
            summary.failures.len()
        );
        Ok((id, summary))
    }

    /// Fetch a live session, touching its last access time. Expired
    /// entries are evicted on the way.
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        let now = Utc::now();
        {
            // The map guard must drop before the remove below.
            let entry = self.sessions.get(id)?;
            if !entry.expired(now, self.ttl_seconds) {
                entry.touch();
                return Some(entry.session.clone());
            }
        }
        self.sessions.remove(id);
        metrics::dec_sessions(1);
        debug!("Session {} evicted on access (TTL expired)", id);
        None
    }

    /// Evict every expired session; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| !entry.expired(now, self.ttl_seconds));
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            metrics::dec_sessions(evicted as i64);
            info!("Swept {} expired session(s)", evicted);
        }
        evicted
    }

    pub fn stats(&self) -> RegistryStats {
        self.sweep();
        let mut total_messages = 0;
        let mut total_tables = 0;
        for entry in self.sessions.iter() {
            // Sessions mid-turn hold their lock; skip their counters.
            if let Ok(session) = entry.session.try_lock() {
                total_messages += session.message_count;
                total_tables += session.schema.len();
            }
        }
        RegistryStats {
            active_sessions: self.sessions.len(),
            total_messages,
            total_tables,
        }
    }

    #[cfg(test)]
    fn force_age(&self, id: &str, seconds: i64) {
        if let Some(entry) = self.sessions.get(id) {
            entry
                .last_access
                .store(Utc::now().timestamp() - seconds, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn created_and_last_access(&self, id: &str) -> Option<(i64, i64)> {
        self.sessions.get(id).map(|entry| {
            (
                entry.created_at.timestamp(),
                entry.last_access.load(Ordering::Relaxed),
            )
        })
    }
}
