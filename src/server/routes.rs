//! Route definitions for the API server

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Creates the main application router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    // Local charting front-ends are served from other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/symbols", get(handlers::list_symbols))
        // Session lifecycle
        .route("/session", post(handlers::start_session))
        .route("/session/restore", post(handlers::restore_session))
        .route("/session/state", get(handlers::get_session_state))
        .route("/session/symbol/:symbol", post(handlers::switch_symbol))
        // Playback
        .route("/playback/play", post(handlers::play))
        .route("/playback/pause", post(handlers::pause))
        .route("/playback/toggle", post(handlers::toggle))
        .route("/playback/speed", post(handlers::set_speed))
        .route("/playback/next", post(handlers::next_bar))
        .route("/playback/jump-next-day", post(handlers::jump_to_next_day))
        // Queries
        .route("/status", get(handlers::get_status))
        .route("/bars", get(handlers::get_bars))
        // SSE streaming
        .route("/stream", get(handlers::handle_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
