use axum::{
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;
use super::ws;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Persistent duplex ingestion channel
        .route("/ws", get(ws::ws_upgrade))
        // Transcript export
        .route(
            "/sessions/:session_id/download",
            get(handlers::download_session),
        )
        // Request logging + permissive CORS for browser clients
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
