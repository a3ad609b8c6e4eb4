//! Shared application state for the API server

use crate::engine::ReplayEngine;
use crate::events::{EventQueue, ReplayEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events buffered per SSE client before it starts lagging
const EVENT_BUFFER: usize = 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The replay session every endpoint drives
    pub engine: ReplayEngine,
    /// Fan-out of engine events to SSE clients
    pub events: broadcast::Sender<ReplayEvent>,
}

impl AppState {
    /// Creates a new application state
    pub fn new(engine: ReplayEngine) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        AppState { engine, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEvent> {
        self.events.subscribe()
    }

    /// Drains the engine's event queue on a tokio task.
    ///
    /// Registered listeners run on that task; every event is then forwarded
    /// to the SSE broadcast channel.
    pub fn spawn_event_pump(&self, mut queue: EventQueue) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = queue.next_event().await {
                // No subscribers is not an error
                let _ = events.send(event);
            }
            tracing::debug!("Replay event queue closed");
        })
    }
}
