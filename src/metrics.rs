// Prometheus metrics definitions for the Whereami backend.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Players currently waiting in the matchmaking queue.
    pub static ref QUEUE_DEPTH: IntGauge =
        IntGauge::new("whereami_queue_depth", "Players waiting in the matchmaking queue").unwrap();

    /// Duels in a non-terminal state.
    pub static ref ACTIVE_DUELS: IntGauge =
        IntGauge::new("whereami_active_duels", "Duels currently in progress").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("whereami_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total duels created by the matchmaker.
    pub static ref DUELS_STARTED_TOTAL: IntCounter =
        IntCounter::new("whereami_duels_started_total", "Total duels created").unwrap();

    /// Total duels finished, by result (player1_wins, player2_wins, draw).
    pub static ref DUELS_FINISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("whereami_duels_finished_total", "Total duels finished"),
        &["result"],
    )
    .unwrap();

    /// Total duels that ended in the error state.
    pub static ref DUELS_ERRORED_TOTAL: IntCounter =
        IntCounter::new("whereami_duels_errored_total", "Total duels marked as errored").unwrap();

    /// Total guesses accepted.
    pub static ref GUESSES_SUBMITTED_TOTAL: IntCounter =
        IntCounter::new("whereami_guesses_submitted_total", "Total guesses accepted").unwrap();

    /// Rounds resolved by timeout rather than both players guessing.
    pub static ref ROUND_TIMEOUTS_TOTAL: IntCounter =
        IntCounter::new("whereami_round_timeouts_total", "Rounds resolved by timeout").unwrap();

    /// Location provider lookups, by outcome (ok, fallback).
    pub static ref LOCATION_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("whereami_location_lookups_total", "Location provider lookups"),
        &["outcome"],
    )
    .unwrap();

    /// Duel events published, by action.
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("whereami_events_published_total", "Duel events published"),
        &["action"],
    )
    .unwrap();
}

/// Register all metrics with the global registry. Call once at startup.
pub fn register_metrics() {
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone())).ok();
    REGISTRY.register(Box::new(ACTIVE_DUELS.clone())).ok();
    REGISTRY.register(Box::new(CONNECTED_WEBSOCKETS.clone())).ok();
    REGISTRY.register(Box::new(DUELS_STARTED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DUELS_FINISHED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DUELS_ERRORED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(GUESSES_SUBMITTED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ROUND_TIMEOUTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(LOCATION_LOOKUPS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(EVENTS_PUBLISHED_TOTAL.clone())).ok();
}

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
