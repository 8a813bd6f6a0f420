// HTTP API routes (matchmaking, duel play, rating history).

pub mod ws;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::GameplayConfig;
use crate::db::{Database, GuessOutcome};
use crate::error::EngineError;
use crate::events::{DuelEventName, EventPublisher};
use crate::geo::Coordinate;
use crate::metrics;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MatchmakingRequest {
    pub user_uid: i64,
}

#[derive(Deserialize)]
pub struct UserParams {
    pub user_uid: i64,
}

#[derive(Deserialize)]
pub struct GuessRequest {
    pub user_uid: i64,
    pub lat: f64,
    pub lng: f64,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub publisher: EventPublisher,
    pub clock: Arc<dyn Clock>,
    pub gameplay: GameplayConfig,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

/// Map an engine error to an HTTP response by its category.
fn engine_error(e: EngineError) -> axum::response::Response {
    let status = match e.category() {
        "not_found" => StatusCode::NOT_FOUND,
        "not_participant" => StatusCode::FORBIDDEN,
        "wrong_state" | "already_guessed" => StatusCode::CONFLICT,
        "invalid_coordinates" => StatusCode::BAD_REQUEST,
        "contention" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("API error: {e}");
        return json_error(status, "Internal server error").into_response();
    }
    (
        status,
        Json(json!({ "error": e.to_string(), "category": e.category() })),
    )
        .into_response()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/api/server-time", get(server_time))
        // Matchmaking
        .route("/api/matchmaking/start", post(start_matchmaking))
        .route("/api/matchmaking/cancel", post(cancel_matchmaking))
        .route("/api/matchmaking/status", get(matchmaking_status))
        // Duel play
        .route("/api/duel/{id}", get(get_duel_snapshot))
        .route("/api/duel/{id}/guess", post(submit_guess))
        .route("/api/duel/{id}/click", post(record_click))
        // Rating
        .route("/api/user/{uid}/rating-history", get(rating_history))
        // WebSocket
        .route("/ws/duel/{id}", get(ws::ws_duel))
        .with_state(state)
}

// ── Misc handlers ─────────────────────────────────────────────────────

async fn get_metrics() -> impl IntoResponse {
    metrics::render()
}

async fn server_time(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "now": crate::db::fmt_ts(state.clock.now()) }))
}

// ── Matchmaking handlers ──────────────────────────────────────────────

async fn start_matchmaking(
    State(state): State<AppState>,
    Json(req): Json<MatchmakingRequest>,
) -> impl IntoResponse {
    // A player already in a live duel rejoins it instead of queueing.
    match state.db.active_duel_for(req.user_uid).await {
        Ok(Some(duel)) => {
            return (StatusCode::OK, Json(json!({ "status": "found", "duel_id": duel.id })))
                .into_response()
        }
        Ok(None) => {}
        Err(e) => return engine_error(e),
    }

    match state.db.enqueue(req.user_uid, state.clock.now()).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "queued" }))).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn cancel_matchmaking(
    State(state): State<AppState>,
    Json(req): Json<MatchmakingRequest>,
) -> impl IntoResponse {
    match state.db.cancel_queue(req.user_uid).await {
        Ok(removed) => (StatusCode::OK, Json(json!({ "removed": removed }))).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn matchmaking_status(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> impl IntoResponse {
    let status = state
        .db
        .queue_status(
            params.user_uid,
            state.clock.now(),
            state.gameplay.queue_ttl_secs,
        )
        .await;
    match status {
        Ok(status) => (StatusCode::OK, Json(json!(status))).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Duel handlers ─────────────────────────────────────────────────────

async fn get_duel_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<UserParams>,
) -> impl IntoResponse {
    match state.db.snapshot_for(&id, params.user_uid).await {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn submit_guess(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<GuessRequest>,
) -> impl IntoResponse {
    let guess = Coordinate::new(req.lat, req.lng);
    match state
        .db
        .submit_guess(&id, req.user_uid, guess, state.clock.now())
        .await
    {
        Ok(outcome) => {
            metrics::GUESSES_SUBMITTED_TOTAL.inc();
            let event = match outcome {
                GuessOutcome::FirstGuess => DuelEventName::FirstGuess,
                GuessOutcome::BothGuessed => DuelEventName::BothGuessed,
            };
            state.publisher.publish(&id, event, json!({ "user_uid": req.user_uid }));
            (StatusCode::OK, Json(json!({ "success": true }))).into_response()
        }
        Err(e) => engine_error(e),
    }
}

async fn record_click(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<GuessRequest>,
) -> impl IntoResponse {
    let position = Coordinate::new(req.lat, req.lng);
    match state.db.record_click(&id, req.user_uid, position).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Rating handlers ───────────────────────────────────────────────────

async fn rating_history(
    State(state): State<AppState>,
    Path(uid): Path<i64>,
) -> impl IntoResponse {
    match state.db.rating_history(uid).await {
        Ok(history) => (StatusCode::OK, Json(json!(history))).into_response(),
        Err(e) => engine_error(e),
    }
}
