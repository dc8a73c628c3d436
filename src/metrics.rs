// Prometheus metrics definitions for the arena backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Matches finished but not yet fully settled, as of the last sweep.
    pub static ref PENDING_SETTLEMENTS: IntGauge =
        IntGauge::new("arena_pending_settlements", "Matches awaiting settlement").unwrap();

    /// Match ids waiting in the settlement queue.
    pub static ref SETTLEMENT_QUEUE_DEPTH: IntGauge =
        IntGauge::new("arena_settlement_queue_depth", "Matches queued for settlement").unwrap();

    /// Settlement tasks currently running.
    pub static ref SETTLEMENT_WORKERS_ACTIVE: IntGauge =
        IntGauge::new("arena_settlement_workers_active", "Settlement workers currently active").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Match state transitions, by transition name.
    pub static ref MATCH_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_match_transitions_total", "Match state transitions"),
        &["transition"],
    )
    .unwrap();

    pub static ref MOVES_RECORDED_TOTAL: IntCounter =
        IntCounter::new("arena_moves_recorded_total", "Moves appended to match logs").unwrap();

    /// Settlement rows applied, by entity kind.
    pub static ref SETTLEMENTS_APPLIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_settlements_applied_total", "Settlement rows applied"),
        &["entity_kind"],
    )
    .unwrap();

    /// Optimistic version checks that lost and had to retry.
    pub static ref VERSION_CONFLICTS_TOTAL: IntCounter = IntCounter::new(
        "arena_version_conflicts_total",
        "Stats writes retried after a version conflict",
    )
    .unwrap();

    /// Settlement rows that failed and were left for the repair sweep.
    pub static ref SETTLEMENT_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "arena_settlement_failures_total",
        "Settlement rows left outstanding after an error",
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Duration of completed matches in seconds.
    pub static ref MATCH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("arena_match_duration_seconds", "Completed match duration in seconds")
            .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "arena_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(PENDING_SETTLEMENTS.clone()),
        Box::new(SETTLEMENT_QUEUE_DEPTH.clone()),
        Box::new(SETTLEMENT_WORKERS_ACTIVE.clone()),
        Box::new(MATCH_TRANSITIONS_TOTAL.clone()),
        Box::new(MOVES_RECORDED_TOTAL.clone()),
        Box::new(SETTLEMENTS_APPLIED_TOTAL.clone()),
        Box::new(VERSION_CONFLICTS_TOTAL.clone()),
        Box::new(SETTLEMENT_FAILURES_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(MATCH_DURATION_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::warn!("metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: numeric and match-id segments
/// become `:id` to keep label cardinality bounded.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() || segment.starts_with("match_") {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
