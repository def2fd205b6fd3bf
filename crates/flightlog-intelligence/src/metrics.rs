use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static TURNS: OnceLock<IntCounter> = OnceLock::new();
static LLM_ROUND_TRIPS: OnceLock<IntCounter> = OnceLock::new();
static TOOL_CALLS: OnceLock<IntCounterVec> = OnceLock::new();
static CORRECTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static REFUSALS: OnceLock<IntCounter> = OnceLock::new();
static TURN_DURATION: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .unwrap()
    });

    let active_sessions = ACTIVE_SESSIONS
        .get_or_init(|| IntGauge::new("active_sessions", "Live analysis sessions").unwrap());

    let turns = TURNS
        .get_or_init(|| IntCounter::new("chat_turns_total", "Completed chat turns").unwrap());

    let llm_round_trips = LLM_ROUND_TRIPS.get_or_init(|| {
        IntCounter::new("llm_round_trips_total", "Outbound LLM calls").unwrap()
    });

    let tool_calls = TOOL_CALLS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("tool_calls_total", "Tool invocations per tool"),
            &["tool"],
        )
        .unwrap()
    });

    let corrections = CORRECTIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("corrections_total", "Correction rounds per kind"),
            &["kind"],
        )
        .unwrap()
    });

    let refusals = REFUSALS.get_or_init(|| {
        IntCounter::new("injection_refusals_total", "Turns refused by the safety gate").unwrap()
    });

    let turn_duration = TURN_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "turn_duration_seconds",
            "Wall time per chat turn",
        ))
        .unwrap()
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(active_sessions.clone())).ok();
    REGISTRY.register(Box::new(turns.clone())).ok();
    REGISTRY.register(Box::new(llm_round_trips.clone())).ok();
    REGISTRY.register(Box::new(tool_calls.clone())).ok();
    REGISTRY.register(Box::new(corrections.clone())).ok();
    REGISTRY.register(Box::new(refusals.clone())).ok();
    REGISTRY.register(Box::new(turn_duration.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.inc();
    }
}

pub fn dec_sessions(n: i64) {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.sub(n);
    }
}

pub fn inc_turns() {
    if let Some(counter) = TURNS.get() {
        counter.inc();
    }
}

pub fn inc_llm_round_trips() {
    if let Some(counter) = LLM_ROUND_TRIPS.get() {
        counter.inc();
    }
}

pub fn inc_tool_call(tool: &str) {
    if let Some(counter) = TOOL_CALLS.get() {
        counter.with_label_values(&[tool]).inc();
    }
}

pub fn inc_correction(kind: &str) {
    if let Some(counter) = CORRECTIONS.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn inc_refusal() {
    if let Some(counter) = REFUSALS.get() {
        counter.inc();
    }
}

pub fn observe_turn_duration(seconds: f64) {
    if let Some(histogram) = TURN_DURATION.get() {
        histogram.observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("metrics encode error: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
