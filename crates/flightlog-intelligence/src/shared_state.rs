//! Application state shared by every HTTP handler.
//!
//! The registry, doc index and gateway are process-scoped singletons,
//! wired once by the composition root in `server.rs` before the listener
//! accepts traffic.

use std::sync::Arc;

use crate::agent::AgentController;
use crate::config::Config;
use crate::docs::DocIndex;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub docs: Arc<DocIndex>,
    pub controller: Arc<AgentController>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        docs: Arc<DocIndex>,
        controller: Arc<AgentController>,
    ) -> Self {
        Self {
            config,
            registry,
            docs,
            controller,
        }
    }
}
