pub mod bar;
pub mod config;
pub mod error;
pub mod store;
pub mod sqlite_store;
pub mod context;
pub mod window;
pub mod events;
pub mod scheduler;
pub mod state;
pub mod engine;
pub mod server;


pub use bar::{Bar, DataSource};
pub use config::{next_day_at, ConfigError, DataCalendar, ReplayConfig, DEFAULT_WINDOW_SIZE};
pub use error::ReplayError;
pub use store::{BarStore, InMemoryBarStore, InMemoryMarket, StoreError, StoreOpener, SymbolCatalog};
pub use sqlite_store::{SqliteBarStore, SqliteCatalog};
pub use context::{ContextStore, ReplayContext};
pub use window::{load_window, needs_reload, window_bounds};
pub use events::{EventQueue, ListenerDispatcher, ListenerId, ReplayEvent, ReplayListener, ReplayStatus};
pub use scheduler::PlaybackScheduler;
pub use state::{PersistedState, RestoreReport, SymbolState};
pub use engine::ReplayEngine;
pub use server::{run_server, ApiError, AppState, ServerConfig};
