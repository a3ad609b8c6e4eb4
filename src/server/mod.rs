//! HTTP control surface with Server-Sent Events

mod error;
mod handlers;
mod routes;
mod state;

pub use error::ApiError;
pub use handlers::{BarsResponse, StatusResponse, StepResponse, SymbolsResponse};
pub use routes::create_router;
pub use state::AppState;

use crate::config::ReplayConfig;
use crate::engine::ReplayEngine;
use crate::sqlite_store::SqliteCatalog;
use crate::state::PersistedState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server host address (default: "127.0.0.1")
    pub host: String,
    /// Server port (default: 3000)
    pub port: u16,
    /// Session state restored on startup and saved on shutdown
    pub state_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
            state_file: None,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            host: host.into(),
            port,
            state_file: None,
        }
    }

    /// Reads `HOST`, `PORT` and `REPLAY_STATE_FILE`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        let host = std::env::var("HOST").unwrap_or(defaults.host);
        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse::<u16>().unwrap_or_else(|e| {
                log::warn!("Ignoring PORT={:?}: {}", raw, e);
                defaults.port
            }),
            Err(_) => defaults.port,
        };

        ServerConfig {
            host,
            port,
            state_file: std::env::var_os("REPLAY_STATE_FILE").map(PathBuf::from),
        }
    }
}

/// Runs the API server until ctrl-c
///
/// # Arguments
/// * `config` - Server configuration
/// * `replay` - Engine configuration; symbols are served from its `data_dir`
///
/// # Returns
/// Returns an error if the server fails to start or encounters a fatal error
///
/// # Example
/// ```rust,no_run
/// use bar_replay::{run_server, ReplayConfig, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     run_server(ServerConfig::default(), ReplayConfig::default()).await?;
///     Ok(())
/// }
/// ```
pub async fn run_server(
    config: ServerConfig,
    replay: ReplayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    // Also captures the library's `log` records
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init();

    let catalog = Arc::new(SqliteCatalog::new(&replay.data_dir, replay.timeframe.clone()));
    let (engine, queue) = ReplayEngine::new(replay, catalog.clone(), catalog)?;

    if let Some(path) = config.state_file.as_ref().filter(|path| path.exists()) {
        match PersistedState::load(path) {
            Ok(saved) => {
                let report = engine.start_session_from_state(&saved);
                tracing::info!(
                    "Restored {} symbol(s) from {} (active: {:?})",
                    report.restored.len(),
                    path.display(),
                    report.active
                );
            }
            Err(e) => tracing::warn!("Not restoring session: {}", e),
        }
    }

    let state = Arc::new(AppState::new(engine.clone()));
    let pump = state.spawn_event_pump(queue);
    let app = routes::create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(path) = &config.state_file {
        match engine.snapshot_state().save(path) {
            Ok(()) => tracing::info!("Session saved to {}", path.display()),
            Err(e) => tracing::error!("Cannot save session: {}", e),
        }
    }
    engine.shutdown();
    pump.abort();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
