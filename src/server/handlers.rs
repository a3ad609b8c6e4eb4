//! HTTP request handlers for API endpoints
//!
//! Operations that may hit a backing store (session changes, steps, seeks,
//! history reads) run on tokio's blocking pool.

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use super::error::ApiError;
use super::state::AppState;
use crate::bar::Bar;
use crate::engine::ReplayEngine;
use crate::events::ReplayStatus;
use crate::state::{PersistedState, RestoreReport};

/// Upper bound on bars returned by one `/bars` request
const MAX_BARS_PER_REQUEST: usize = 5_000;

async fn blocking<T, F>(engine: &ReplayEngine, f: F) -> Result<T, ApiError>
where
    F: FnOnce(ReplayEngine) -> T + Send + 'static,
    T: Send + 'static,
{
    let engine = engine.clone();
    Ok(tokio::task::spawn_blocking(move || f(engine)).await?)
}

/// Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok"
    }))
}

/// Playback state of the active symbol
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub symbol: Option<String>,
    pub status: ReplayStatus,
    pub head_index: Option<usize>,
    pub total_bar_count: usize,
    pub speed_ms: u64,
    pub current_bar: Option<Bar>,
}

impl StatusResponse {
    fn from_engine(engine: &ReplayEngine) -> Self {
        StatusResponse {
            symbol: engine.active_symbol(),
            status: engine.status(),
            head_index: engine.head_index(),
            total_bar_count: engine.total_bar_count(),
            speed_ms: engine.speed_ms(),
            current_bar: engine.current_bar(),
        }
    }
}

/// GET /status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    let status = blocking(&state.engine, |engine| StatusResponse::from_engine(&engine)).await?;
    Ok(Json(status))
}

/// Response for symbol listing
#[derive(Debug, Serialize)]
pub struct SymbolsResponse {
    /// Symbols the catalog can serve
    pub available: Vec<String>,
    /// Symbols loaded in the current session
    pub known: Vec<String>,
    pub active: Option<String>,
}

/// GET /symbols
pub async fn list_symbols(State(state): State<Arc<AppState>>) -> Json<SymbolsResponse> {
    Json(SymbolsResponse {
        available: state.engine.available_symbols(),
        known: state.engine.known_symbols(),
        active: state.engine.active_symbol(),
    })
}

/// Request to start a new session
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub symbol: String,
    #[serde(default)]
    pub start_index: usize,
}

/// POST /session
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let source = state
        .engine
        .resolve(&request.symbol)
        .ok_or_else(|| ApiError::SymbolNotFound(request.symbol.clone()))?;

    let status = blocking(&state.engine, move |engine| {
        engine
            .start_session(source, request.start_index)
            .map(|_| StatusResponse::from_engine(&engine))
    })
    .await??;
    Ok(Json(status))
}

/// POST /session/restore
pub async fn restore_session(
    State(state): State<Arc<AppState>>,
    Json(saved): Json<PersistedState>,
) -> Result<Json<RestoreReport>, ApiError> {
    let report = blocking(&state.engine, move |engine| {
        engine.start_session_from_state(&saved)
    })
    .await?;
    Ok(Json(report))
}

/// GET /session/state
pub async fn get_session_state(State(state): State<Arc<AppState>>) -> Json<PersistedState> {
    Json(state.engine.snapshot_state())
}

/// POST /session/symbol/{symbol}
pub async fn switch_symbol(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    if symbol.trim().is_empty() {
        return Err(ApiError::InvalidParameter("Symbol cannot be empty".to_string()));
    }

    let status = blocking(&state.engine, move |engine| {
        engine.switch_active_symbol(&symbol);
        StatusResponse::from_engine(&engine)
    })
    .await?;
    Ok(Json(status))
}

/// POST /playback/play
pub async fn play(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    let status = blocking(&state.engine, |engine| {
        engine.play();
        StatusResponse::from_engine(&engine)
    })
    .await?;
    Ok(Json(status))
}

/// POST /playback/pause
pub async fn pause(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    let status = blocking(&state.engine, |engine| {
        engine.pause();
        StatusResponse::from_engine(&engine)
    })
    .await?;
    Ok(Json(status))
}

/// POST /playback/toggle
pub async fn toggle(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    let status = blocking(&state.engine, |engine| {
        engine.toggle_play_pause();
        StatusResponse::from_engine(&engine)
    })
    .await?;
    Ok(Json(status))
}

/// Request to change playback speed
#[derive(Debug, Deserialize)]
pub struct SpeedRequest {
    /// Milliseconds between bars
    pub ms: u64,
}

/// POST /playback/speed
pub async fn set_speed(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SpeedRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = blocking(&state.engine, move |engine| {
        engine.set_speed(request.ms);
        StatusResponse::from_engine(&engine)
    })
    .await?;
    Ok(Json(status))
}

/// Outcome of a manual step or seek
#[derive(Debug, Serialize)]
pub struct StepResponse {
    /// Whether the head moved
    pub moved: bool,
    #[serde(flatten)]
    pub status: StatusResponse,
}

/// POST /playback/next
pub async fn next_bar(State(state): State<Arc<AppState>>) -> Result<Json<StepResponse>, ApiError> {
    let response = blocking(&state.engine, |engine| StepResponse {
        moved: engine.next_bar().is_some(),
        status: StatusResponse::from_engine(&engine),
    })
    .await?;
    Ok(Json(response))
}

/// POST /playback/jump-next-day
pub async fn jump_to_next_day(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StepResponse>, ApiError> {
    let response = blocking(&state.engine, |engine| StepResponse {
        moved: engine.jump_to_next_day().is_some(),
        status: StatusResponse::from_engine(&engine),
    })
    .await?;
    Ok(Json(response))
}

/// Query parameters for the bars endpoint
#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    pub from: usize,
    #[serde(default = "default_bar_count")]
    pub count: usize,
}

fn default_bar_count() -> usize {
    500
}

/// Response for a bar range query
#[derive(Debug, Serialize)]
pub struct BarsResponse {
    pub symbol: Option<String>,
    pub from: usize,
    pub bars: Vec<Bar>,
}

/// GET /bars?from=&count=
pub async fn get_bars(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BarsQuery>,
) -> Result<Json<BarsResponse>, ApiError> {
    if query.count > MAX_BARS_PER_REQUEST {
        return Err(ApiError::InvalidParameter(format!(
            "count must be at most {}",
            MAX_BARS_PER_REQUEST
        )));
    }

    let response = blocking(&state.engine, move |engine| BarsResponse {
        symbol: engine.active_symbol(),
        from: query.from,
        bars: engine.bars_in_range(query.from, query.count),
    })
    .await?;
    Ok(Json(response))
}

/// GET /stream - SSE stream of replay events
///
/// Each event's SSE type is the event kind (`tick`, `session_start`,
/// `state_changed`) and its data is the JSON-encoded event.
pub async fn handle_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.subscribe();

    let stream = async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().event(event.kind()).json_data(&event) {
                    Ok(sse) => yield Ok::<Event, Infallible>(sse),
                    Err(e) => tracing::warn!("Cannot encode {} event: {}", event.kind(), e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("SSE client lagging; skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
