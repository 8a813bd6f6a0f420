use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use whereami_backend::api::{self, AppState};
use whereami_backend::clock::SystemClock;
use whereami_backend::config::Config;
use whereami_backend::db::Database;
use whereami_backend::events::EventPublisher;
use whereami_backend::location::StreetViewProvider;
use whereami_backend::matchmaking::{spawn_matchmaker, Matchmaker};
use whereami_backend::metrics;
use whereami_backend::sweep::{spawn_sweeper, Sweeper};

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "whereami-backend" }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    let clock = Arc::new(SystemClock);
    let publisher = EventPublisher::default();
    let provider = Arc::new(StreetViewProvider::new(
        config.maps_api_key.clone(),
        config.region_reselect_weights.clone(),
    ));

    // Background workers: pairing and time-driven duel progression.
    let matchmaker = Arc::new(Matchmaker::new(
        db.clone(),
        provider,
        clock.clone(),
        config.gameplay.clone(),
    ));
    spawn_matchmaker(matchmaker);

    let sweeper = Arc::new(Sweeper::new(
        db.clone(),
        publisher.clone(),
        clock.clone(),
        config.gameplay.clone(),
    ));
    spawn_sweeper(sweeper);

    let state = AppState {
        db,
        publisher,
        clock,
        gameplay: config.gameplay.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::router(state))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Whereami backend listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
