//! Tracing initialization for the analysis service.
//!
//! `RUST_LOG` takes precedence when set; otherwise the filter is derived
//! from the configured level, scoped to this crate so dependency noise
//! stays at `warn`.

use tracing_subscriber::{fmt, EnvFilter};

const SERVICE_NAME: &str = "flightlog-intelligence";

fn default_filter(level: &str) -> String {
    format!(
        "warn,flightlog_intelligence={level},tower_http={level}",
        level = level
    )
}

pub fn init_tracing(default_level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!(service = SERVICE_NAME, filter = %filter, "telemetry initialized");
    }
}
