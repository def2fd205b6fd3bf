pub mod agent;
pub mod api;
pub mod config;
pub mod docs;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod safety;
pub mod server;
pub mod session;
pub mod shared_state;
pub mod tabular;
pub mod telemetry;
pub mod tools;
pub mod utils;
pub mod validator;

// Public API exports
pub use agent::{AgentController, TurnOutput};
pub use config::Config;
pub use server::run_server;
pub use session::{Session, SessionRegistry};
pub use tabular::{ingest_log, IngestSummary, TabularStore};
