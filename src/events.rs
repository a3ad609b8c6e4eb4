//! Listener fan-out
//!
//! The engine never calls listener code itself. [`ListenerDispatcher::dispatch`]
//! only enqueues a [`ReplayEvent`]; the consumer owns the matching
//! [`EventQueue`] and drains it on its own thread (a UI loop calls
//! [`EventQueue::dispatch_pending`], an async consumer awaits
//! [`EventQueue::next_event`]). Registered listeners run during the drain, on
//! the draining thread.

use crate::bar::Bar;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Playback state of the active symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStatus {
    /// No active symbol
    Unloaded,
    /// Window loaded, playback not started since the session began
    Ready,
    /// Scheduler is ticking
    Playing,
    /// Playback stopped by the user or by an error
    Paused,
    /// Head is on the last bar
    Finished,
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayStatus::Unloaded => write!(f, "Unloaded"),
            ReplayStatus::Ready => write!(f, "Ready"),
            ReplayStatus::Playing => write!(f, "Playing"),
            ReplayStatus::Paused => write!(f, "Paused"),
            ReplayStatus::Finished => write!(f, "Finished"),
        }
    }
}

/// Notification emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    /// Head moved to `index`; `bar` is the new current bar
    Tick {
        symbol: String,
        index: usize,
        bar: Bar,
    },
    /// A session started, was restored, or switched symbol
    SessionStart { symbol: Option<String> },
    /// Playback started or stopped
    StateChanged { status: ReplayStatus },
}

impl ReplayEvent {
    /// Short name used for SSE event types and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplayEvent::Tick { .. } => "tick",
            ReplayEvent::SessionStart { .. } => "session_start",
            ReplayEvent::StateChanged { .. } => "state_changed",
        }
    }
}

/// Consumer of engine notifications.
///
/// All methods have empty defaults so listeners implement only what they need.
pub trait ReplayListener: Send + Sync {
    fn on_tick(&self, _symbol: &str, _index: usize, _bar: &Bar) {}
    fn on_session_start(&self, _symbol: Option<&str>) {}
    fn on_state_changed(&self, _status: ReplayStatus) {}
}

/// Handle returned by [`ListenerDispatcher::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Registry = Arc<RwLock<Vec<(ListenerId, Arc<dyn ReplayListener>)>>>;

/// Producer side: listener registry plus the event queue sender.
pub struct ListenerDispatcher {
    listeners: Registry,
    sender: mpsc::UnboundedSender<ReplayEvent>,
    next_id: AtomicU64,
}

impl ListenerDispatcher {
    /// Creates a dispatcher and the queue its events are delivered through.
    pub fn new() -> (Self, EventQueue) {
        let listeners: Registry = Arc::new(RwLock::new(Vec::new()));
        let (sender, receiver) = mpsc::unbounded_channel();

        let dispatcher = ListenerDispatcher {
            listeners: Arc::clone(&listeners),
            sender,
            next_id: AtomicU64::new(1),
        };
        let queue = EventQueue {
            listeners,
            receiver,
        };
        (dispatcher, queue)
    }

    pub fn add_listener(&self, listener: Arc<dyn ReplayListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Enqueues `event` for delivery on the consumer's thread.
    pub fn dispatch(&self, event: ReplayEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("Event queue dropped; discarding event");
        }
    }
}

/// Consumer side of the event queue.
pub struct EventQueue {
    listeners: Registry,
    receiver: mpsc::UnboundedReceiver<ReplayEvent>,
}

impl EventQueue {
    /// Delivers every queued event to the listeners without blocking.
    ///
    /// # Returns
    /// Number of events delivered.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.deliver(&event);
            delivered += 1;
        }
        delivered
    }

    /// Waits for the next event, delivers it to the listeners and returns it.
    ///
    /// Returns `None` once the engine has been dropped and the queue is empty.
    pub async fn next_event(&mut self) -> Option<ReplayEvent> {
        let event = self.receiver.recv().await?;
        self.deliver(&event);
        Some(event)
    }

    /// Takes the next queued event, if any, delivering it to the listeners.
    pub fn try_next_event(&mut self) -> Option<ReplayEvent> {
        let event = self.receiver.try_recv().ok()?;
        self.deliver(&event);
        Some(event)
    }

    fn deliver(&self, event: &ReplayEvent) {
        // Snapshot so listeners may (un)register while being notified
        let listeners: Vec<Arc<dyn ReplayListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            // A panicking listener must not take the consumer loop down with it
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match event {
                ReplayEvent::Tick { symbol, index, bar } => listener.on_tick(symbol, *index, bar),
                ReplayEvent::SessionStart { symbol } => listener.on_session_start(symbol.as_deref()),
                ReplayEvent::StateChanged { status } => listener.on_state_changed(*status),
            }));
            if outcome.is_err() {
                log::error!("Listener panicked while handling {} event", event.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ReplayListener for Recorder {
        fn on_tick(&self, symbol: &str, index: usize, _bar: &Bar) {
            self.seen.lock().push(format!("tick {} {}", symbol, index));
        }

        fn on_session_start(&self, symbol: Option<&str>) {
            self.seen.lock().push(format!("start {:?}", symbol));
        }

        fn on_state_changed(&self, status: ReplayStatus) {
            self.seen.lock().push(format!("state {}", status));
        }
    }

    struct Panicker;

    impl ReplayListener for Panicker {
        fn on_tick(&self, _symbol: &str, _index: usize, _bar: &Bar) {
            panic!("listener bug");
        }
    }

    fn tick(index: usize) -> ReplayEvent {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        ReplayEvent::Tick {
            symbol: "EURUSD".to_string(),
            index,
            bar: Bar::flat(ts, 1.1),
        }
    }

    #[test]
    fn test_dispatch_only_enqueues() {
        let (dispatcher, mut queue) = ListenerDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener(recorder.clone());

        dispatcher.dispatch(tick(1));
        assert!(recorder.seen.lock().is_empty());

        assert_eq!(queue.dispatch_pending(), 1);
        assert_eq!(*recorder.seen.lock(), vec!["tick EURUSD 1"]);
    }

    #[test]
    fn test_events_delivered_in_order() {
        let (dispatcher, mut queue) = ListenerDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener(recorder.clone());

        dispatcher.dispatch(ReplayEvent::SessionStart {
            symbol: Some("EURUSD".to_string()),
        });
        dispatcher.dispatch(ReplayEvent::StateChanged {
            status: ReplayStatus::Playing,
        });
        dispatcher.dispatch(tick(1));
        dispatcher.dispatch(tick(2));
        queue.dispatch_pending();

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                "start Some(\"EURUSD\")",
                "state Playing",
                "tick EURUSD 1",
                "tick EURUSD 2"
            ]
        );
    }

    #[test]
    fn test_remove_listener() {
        let (dispatcher, mut queue) = ListenerDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher.add_listener(recorder.clone());

        assert!(dispatcher.remove_listener(id));
        assert!(!dispatcher.remove_listener(id));
        assert_eq!(dispatcher.listener_count(), 0);

        dispatcher.dispatch(tick(1));
        queue.dispatch_pending();
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let (dispatcher, mut queue) = ListenerDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener(Arc::new(Panicker));
        dispatcher.add_listener(recorder.clone());

        dispatcher.dispatch(tick(7));
        queue.dispatch_pending();
        assert_eq!(*recorder.seen.lock(), vec!["tick EURUSD 7"]);
    }

    #[tokio::test]
    async fn test_next_event_returns_none_after_dispatcher_drop() {
        let (dispatcher, mut queue) = ListenerDispatcher::new();
        dispatcher.dispatch(tick(3));
        drop(dispatcher);

        assert_eq!(queue.next_event().await, Some(tick(3)));
        assert_eq!(queue.next_event().await, None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(ReplayEvent::StateChanged {
            status: ReplayStatus::Paused,
        })
        .unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["status"], "paused");
    }
}
