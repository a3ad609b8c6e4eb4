//! Bar-by-bar replay engine
//!
//! [`ReplayEngine`] owns one replay session: a set of per-symbol contexts, the
//! active-symbol marker, the playback scheduler and the listener dispatcher.
//! It is a cheap `Clone` handle; every clone drives the same session.
//!
//! # Example
//!
//! ```rust,no_run
//! use bar_replay::{ReplayConfig, ReplayEngine, SqliteCatalog};
//! use std::sync::Arc;
//!
//! let config = ReplayConfig::from_env();
//! let catalog = Arc::new(SqliteCatalog::new(&config.data_dir, config.timeframe.clone()));
//! let (engine, mut events) = ReplayEngine::new(config, catalog.clone(), catalog).unwrap();
//!
//! let source = engine.available_symbols().first().and_then(|s| engine.resolve(s)).unwrap();
//! engine.start_session(source, 0).unwrap();
//! engine.next_bar();
//! events.dispatch_pending();
//! ```

use crate::bar::{Bar, DataSource};
use crate::config::{DataCalendar, ReplayConfig};
use crate::context::{ContextStore, ReplayContext};
use crate::error::ReplayError;
use crate::events::{
    EventQueue, ListenerDispatcher, ListenerId, ReplayEvent, ReplayListener, ReplayStatus,
};
use crate::scheduler::PlaybackScheduler;
use crate::state::{PersistedState, RestoreReport, SymbolState};
use crate::store::{StoreOpener, SymbolCatalog};
use crate::window;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Handle to a replay session.
#[derive(Clone)]
pub struct ReplayEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    // Dropped first so no tick can run against a half-dropped engine
    scheduler: PlaybackScheduler,
    config: ReplayConfig,
    calendar: DataCalendar,
    contexts: ContextStore,
    dispatcher: ListenerDispatcher,
    speed_ms: AtomicU64,
    /// Serializes head movement and session changes
    mutation: Mutex<()>,
    /// Set by the first `play()` of a session; distinguishes Ready from Paused
    started: AtomicBool,
    /// Per-symbol persisted state carried through the session
    carried: RwLock<BTreeMap<String, SymbolState>>,
}

impl ReplayEngine {
    /// Creates an engine with no session loaded.
    ///
    /// # Arguments
    /// * `config` - Engine configuration (validated here)
    /// * `catalog` - Resolves symbols to data sources
    /// * `opener` - Opens bar stores for data sources
    ///
    /// # Returns
    /// The engine and the queue its events are delivered through. The queue
    /// is unbounded: drain it (or drop it, which discards later events) or it
    /// grows with every tick.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an unusable config and
    /// `SchedulerUnavailable` if the scheduler thread can't be started.
    pub fn new(
        config: ReplayConfig,
        catalog: Arc<dyn SymbolCatalog>,
        opener: Arc<dyn StoreOpener>,
    ) -> Result<(Self, EventQueue), ReplayError> {
        config.validate()?;
        let calendar = config.data_calendar()?;

        let slot: Arc<OnceLock<Weak<EngineInner>>> = Arc::new(OnceLock::new());
        let tick_slot = Arc::clone(&slot);
        let scheduler = PlaybackScheduler::spawn(move || {
            if let Some(inner) = tick_slot.get().and_then(Weak::upgrade) {
                ReplayEngine { inner }.scheduled_tick();
            }
        })
        .map_err(|e| ReplayError::SchedulerUnavailable(e.to_string()))?;

        let (dispatcher, queue) = ListenerDispatcher::new();
        let inner = Arc::new(EngineInner {
            scheduler,
            speed_ms: AtomicU64::new(config.default_speed_ms.max(1)),
            calendar,
            contexts: ContextStore::new(catalog, opener),
            dispatcher,
            mutation: Mutex::new(()),
            started: AtomicBool::new(false),
            carried: RwLock::new(BTreeMap::new()),
            config,
        });
        let _ = slot.set(Arc::downgrade(&inner));

        log::info!(
            "Replay engine ready (window {} bars, {} ms per bar)",
            inner.config.window_size,
            inner.speed_ms.load(Ordering::SeqCst)
        );
        Ok((ReplayEngine { inner }, queue))
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.inner.config
    }

    /// Looks `symbol` up in the catalog.
    pub fn resolve(&self, symbol: &str) -> Option<DataSource> {
        self.inner.contexts.catalog().resolve(symbol)
    }

    // ----- session lifecycle -------------------------------------------------

    /// Replaces the current session with a single symbol starting at `start_index`.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the source's store can't be opened. The
    /// engine is then left with no active symbol.
    pub fn start_session(&self, source: DataSource, start_index: usize) -> Result<(), ReplayError> {
        let _guard = self.inner.mutation.lock();
        self.reset_session();

        let result = match self.inner.contexts.create(&source, start_index) {
            Ok(context) => {
                let symbol = context.symbol().to_string();
                let context = self.loaded(context);
                log::info!(
                    "Session started on {} at bar {} of {}",
                    source,
                    context.head_index(),
                    context.total_bar_count()
                );
                self.inner.contexts.replace(context);
                self.inner.contexts.set_active(Some(symbol));
                Ok(())
            }
            Err(e) => {
                log::warn!("Session for {} not started: {}", source, e);
                Err(ReplayError::store(&source.symbol, e))
            }
        };

        self.emit(ReplayEvent::SessionStart {
            symbol: self.inner.contexts.active_symbol(),
        });
        result
    }

    /// Replaces the current session with a persisted one.
    ///
    /// Symbols that can't be resolved or opened are skipped; their persisted
    /// state is kept so a later snapshot still carries it.
    pub fn start_session_from_state(&self, state: &PersistedState) -> RestoreReport {
        let _guard = self.inner.mutation.lock();
        self.reset_session();

        let mut report = RestoreReport::default();
        for (symbol, symbol_state) in &state.symbol_states {
            let restored = match self.inner.contexts.catalog().resolve(symbol) {
                Some(source) => self.inner.contexts.create(&source, symbol_state.head_index).ok(),
                None => {
                    log::warn!("Skipping {}: not in the catalog", symbol);
                    None
                }
            };

            match restored {
                Some(context) => {
                    if context.head_index() != symbol_state.head_index {
                        log::warn!(
                            "Restored head for {} clamped from {} to {}",
                            symbol,
                            symbol_state.head_index,
                            context.head_index()
                        );
                    }
                    self.inner.contexts.replace(context);
                    report.restored.push(symbol.clone());
                }
                None => report.skipped.push(symbol.clone()),
            }
        }
        *self.inner.carried.write() = state.symbol_states.clone();

        let active = match &state.last_active_symbol {
            Some(last) => self.inner.contexts.switch_active(last),
            None => {
                let first = self.inner.contexts.symbols().into_iter().next();
                self.inner.contexts.set_active(first.clone());
                first
            }
        };
        self.load_active_window();
        report.active = active.clone();

        log::info!(
            "Restored {} symbol(s), skipped {}, active {:?}",
            report.restored.len(),
            report.skipped.len(),
            active
        );
        self.emit(ReplayEvent::SessionStart { symbol: active });
        report
    }

    /// Makes `symbol` the active symbol, creating its context on first use.
    ///
    /// Falls back to the current or another known symbol if `symbol` can't be
    /// loaded. A no-op for an empty or already active symbol.
    ///
    /// # Returns
    /// The symbol active afterwards.
    pub fn switch_active_symbol(&self, symbol: &str) -> Option<String> {
        let _guard = self.inner.mutation.lock();
        let current = self.inner.contexts.active_symbol();
        if symbol.is_empty() || current.as_deref() == Some(symbol) {
            return current;
        }

        self.pause();
        let active = self.inner.contexts.switch_active(symbol);
        self.load_active_window();
        self.inner.started.store(false, Ordering::SeqCst);

        log::info!("Active symbol is now {:?}", active);
        self.emit(ReplayEvent::SessionStart {
            symbol: active.clone(),
        });
        active
    }

    // ----- playback ----------------------------------------------------------

    /// Starts scheduled playback of the active symbol.
    ///
    /// # Returns
    /// `true` if playback started; `false` if already playing, nothing is
    /// active, or the active symbol is finished.
    pub fn play(&self) -> bool {
        // Held until Playing is emitted so the first tick can't overtake it
        let _guard = self.inner.mutation.lock();
        let Some(context) = self.inner.contexts.active() else {
            log::debug!("Nothing to play: no active symbol");
            return false;
        };
        if context.is_finished() {
            log::info!("{} is finished; play ignored", context.symbol());
            return false;
        }

        let interval = Duration::from_millis(self.speed_ms());
        if !self.inner.scheduler.play(interval) {
            return false;
        }
        self.inner.started.store(true, Ordering::SeqCst);
        self.emit(ReplayEvent::StateChanged {
            status: ReplayStatus::Playing,
        });
        true
    }

    /// Stops scheduled playback. A tick already running completes.
    ///
    /// # Returns
    /// `true` if playback was running.
    pub fn pause(&self) -> bool {
        if !self.inner.scheduler.pause() {
            return false;
        }
        self.emit(ReplayEvent::StateChanged {
            status: self.status(),
        });
        true
    }

    /// # Returns
    /// Whether the engine is playing afterwards.
    pub fn toggle_play_pause(&self) -> bool {
        if self.is_playing() {
            self.pause();
        } else {
            self.play();
        }
        self.is_playing()
    }

    /// Sets the tick interval. Takes effect immediately when playing.
    ///
    /// # Returns
    /// The interval actually applied (at least 1 ms).
    pub fn set_speed(&self, ms: u64) -> u64 {
        let ms = ms.max(1);
        self.inner.speed_ms.store(ms, Ordering::SeqCst);
        if self.is_playing() {
            self.pause();
            self.play();
        }
        log::debug!("Replay speed set to {} ms per bar", ms);
        ms
    }

    /// Advances the active symbol by one bar.
    ///
    /// # Returns
    /// The new current bar, or `None` if nothing is active, the replay is
    /// finished, or the bar could not be loaded. In each of those cases
    /// playback is paused.
    pub fn next_bar(&self) -> Option<Bar> {
        let _guard = self.inner.mutation.lock();
        self.advance()
    }

    fn scheduled_tick(&self) {
        let _guard = self.inner.mutation.lock();
        // A pause or session change may have landed while this tick waited
        if self.inner.scheduler.is_playing() {
            self.advance();
        }
    }

    fn advance(&self) -> Option<Bar> {
        let Some(context) = self.inner.contexts.active() else {
            self.pause();
            return None;
        };
        if context.is_finished() {
            self.pause();
            return None;
        }

        let advanced = context.with_head(context.head_index() + 1);
        self.commit_seek(advanced).map(|(_, bar)| bar)
    }

    /// Seeks the active symbol to the first bar of the next trading day.
    ///
    /// The target is the next calendar day of the current bar (in the data's
    /// zone or UTC offset) at the configured fast-forward time.
    ///
    /// # Returns
    /// The new head index, or `None` if there is no bar forward of the head.
    pub fn jump_to_next_day(&self) -> Option<usize> {
        let _guard = self.inner.mutation.lock();
        let Some(context) = self.inner.contexts.active() else {
            log::warn!("Jump to next day ignored: no active symbol");
            return None;
        };
        let context = self.readable(context)?;
        let bar = context.current_bar()?;

        let Some(target) = self
            .inner
            .calendar
            .next_day_at(bar.timestamp, self.inner.config.fast_forward_time)
        else {
            log::warn!("No next day after {}", bar.timestamp);
            return None;
        };

        let index = match context.store().nearest_index_for_timestamp(target) {
            Ok(Some(index)) if index > context.head_index() => index,
            Ok(Some(index)) => {
                log::warn!(
                    "Jump target {} (bar {}) is not forward of head {}",
                    target,
                    index,
                    context.head_index()
                );
                return None;
            }
            Ok(None) => {
                log::warn!("No bar at or after {} for {}", target, context.symbol());
                return None;
            }
            Err(e) => {
                log::warn!("Jump lookup for {} failed: {}", context.symbol(), e);
                return None;
            }
        };

        log::info!("Jumping {} to bar {} ({})", context.symbol(), index, target);
        self.commit_seek(context.with_head(index)).map(|(index, _)| index)
    }

    /// Stores `moved`, reloading its window if needed, and emits a tick.
    fn commit_seek(&self, mut moved: ReplayContext) -> Option<(usize, Bar)> {
        if window::needs_reload(&moved) {
            match window::load_window(&moved, self.inner.config.window_size) {
                Ok(reloaded) => moved = reloaded,
                Err(e) => {
                    log::error!(
                        "FATAL: window reload for {} at bar {} failed: {}",
                        moved.symbol(),
                        moved.head_index(),
                        e
                    );
                    self.pause();
                    return None;
                }
            }
        }

        let Some(bar) = moved.current_bar().cloned() else {
            log::error!(
                "FATAL: head {} of {} outside window [{}, {}) after reload",
                moved.head_index(),
                moved.symbol(),
                moved.window_start(),
                moved.window_end()
            );
            self.pause();
            return None;
        };

        let stored = self.inner.contexts.replace(moved);
        let index = stored.head_index();
        self.emit(ReplayEvent::Tick {
            symbol: stored.symbol().to_string(),
            index,
            bar: bar.clone(),
        });

        if stored.is_finished() {
            log::info!("Replay of {} finished at bar {}", stored.symbol(), index);
            self.pause();
        }
        Some((index, bar))
    }

    // ----- queries -----------------------------------------------------------

    /// Current bar of the active symbol, reloading the window if it went stale.
    pub fn current_bar(&self) -> Option<Bar> {
        let context = self.inner.contexts.active()?;
        self.readable(context)?.current_bar().cloned()
    }

    /// Up to `count` bars of the active symbol starting at absolute index `from`.
    ///
    /// Served from the window when it covers the range, otherwise read
    /// straight from the store without touching the window.
    pub fn bars_in_range(&self, from: usize, count: usize) -> Vec<Bar> {
        let Some(context) = self.inner.contexts.active() else {
            return Vec::new();
        };
        let end = from.saturating_add(count).min(context.total_bar_count());
        if from >= end {
            return Vec::new();
        }

        if context.contains(from) && context.contains(end - 1) {
            let offset = from - context.window_start();
            return context.window()[offset..offset + (end - from)].to_vec();
        }

        match context.store().fetch_range(from, end - from) {
            Ok(bars) => bars,
            Err(e) => {
                log::warn!("Cannot read bars {}..{} of {}: {}", from, end, context.symbol(), e);
                Vec::new()
            }
        }
    }

    /// Index of the active symbol's first bar at or after `instant`.
    pub fn nearest_index_for_timestamp(&self, instant: DateTime<Utc>) -> Option<usize> {
        let context = self.inner.contexts.active()?;
        context
            .store()
            .nearest_index_for_timestamp(instant)
            .unwrap_or_else(|e| {
                log::warn!("Timestamp lookup for {} failed: {}", context.symbol(), e);
                None
            })
    }

    pub fn head_index(&self) -> Option<usize> {
        self.inner.contexts.active().map(|c| c.head_index())
    }

    pub fn head_index_of(&self, symbol: &str) -> Option<usize> {
        self.inner.contexts.get(symbol).map(|c| c.head_index())
    }

    /// Bar count of the active symbol; 0 when nothing is active.
    pub fn total_bar_count(&self) -> usize {
        self.inner
            .contexts
            .active()
            .map_or(0, |c| c.total_bar_count())
    }

    /// Snapshot of the active symbol's context.
    pub fn active_context(&self) -> Option<Arc<ReplayContext>> {
        self.inner.contexts.active()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.scheduler.is_playing()
    }

    pub fn is_finished(&self) -> bool {
        self.inner
            .contexts
            .active()
            .is_some_and(|c| c.is_finished())
    }

    pub fn status(&self) -> ReplayStatus {
        match self.inner.contexts.active() {
            None => ReplayStatus::Unloaded,
            Some(context) if context.is_finished() => ReplayStatus::Finished,
            Some(_) if self.is_playing() => ReplayStatus::Playing,
            Some(_) if self.inner.started.load(Ordering::SeqCst) => ReplayStatus::Paused,
            Some(_) => ReplayStatus::Ready,
        }
    }

    pub fn speed_ms(&self) -> u64 {
        self.inner.speed_ms.load(Ordering::SeqCst)
    }

    pub fn active_symbol(&self) -> Option<String> {
        self.inner.contexts.active_symbol()
    }

    /// Symbols with a context in this session.
    pub fn known_symbols(&self) -> Vec<String> {
        self.inner.contexts.symbols()
    }

    /// Symbols the catalog can resolve.
    pub fn available_symbols(&self) -> Vec<String> {
        self.inner.contexts.catalog().symbols()
    }

    // ----- listeners ---------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn ReplayListener>) -> ListenerId {
        self.inner.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.remove_listener(id)
    }

    // ----- persistence -------------------------------------------------------

    /// Captures the session so it can be restored later.
    ///
    /// Heads come from the live contexts; annotations and skipped symbols are
    /// carried over from the last restore and [`ReplayEngine::set_annotations`].
    pub fn snapshot_state(&self) -> PersistedState {
        let mut symbol_states = self.inner.carried.read().clone();
        for symbol in self.inner.contexts.symbols() {
            if let Some(context) = self.inner.contexts.get(&symbol) {
                symbol_states
                    .entry(symbol)
                    .or_default()
                    .head_index = context.head_index();
            }
        }

        PersistedState {
            last_active_symbol: self.active_symbol(),
            symbol_states,
        }
    }

    /// Replaces the opaque annotations stored with `symbol`.
    pub fn set_annotations(&self, symbol: &str, annotations: Map<String, Value>) {
        let head_index = self.head_index_of(symbol).unwrap_or(0);
        let mut carried = self.inner.carried.write();
        let entry = carried
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(head_index));
        entry.annotations = annotations;
    }

    /// Stops the scheduler thread for good. Later `play()` calls are ignored.
    pub fn shutdown(&self) {
        self.pause();
        self.inner.scheduler.shutdown();
        log::info!("Replay engine shut down");
    }

    // ----- internals ---------------------------------------------------------

    fn emit(&self, event: ReplayEvent) {
        self.inner.dispatcher.dispatch(event);
    }

    /// Pauses and drops every context of the current session.
    fn reset_session(&self) {
        self.pause();
        self.inner.contexts.cleanup();
        self.inner.carried.write().clear();
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// `context` with its window loaded; the unloaded context if the fetch fails.
    fn loaded(&self, context: ReplayContext) -> ReplayContext {
        match window::load_window(&context, self.inner.config.window_size) {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("Cannot load window for {}: {}", context.symbol(), e);
                context
            }
        }
    }

    fn load_active_window(&self) {
        if let Some(context) = self.inner.contexts.active() {
            if window::needs_reload(&context) {
                self.inner.contexts.replace(self.loaded((*context).clone()));
            }
        }
    }

    /// Returns a context whose head bar is resident, repairing the cache if needed.
    fn readable(&self, context: Arc<ReplayContext>) -> Option<Arc<ReplayContext>> {
        if !window::needs_reload(&context) {
            return Some(context);
        }

        if context.window().is_empty() {
            log::debug!("First window load for {}", context.symbol());
        } else {
            log::warn!(
                "Head {} of {} outside window [{}, {}); reloading",
                context.head_index(),
                context.symbol(),
                context.window_start(),
                context.window_end()
            );
        }

        match window::load_window(&context, self.inner.config.window_size) {
            Ok(reloaded) if reloaded.head_in_window() => {
                let repaired = self
                    .inner
                    .contexts
                    .replace_if_current(&context, reloaded.clone())
                    .unwrap_or_else(|| Arc::new(reloaded));
                Some(repaired)
            }
            Ok(reloaded) => {
                log::error!(
                    "FATAL: head {} of {} still outside window [{}, {}) after reload",
                    reloaded.head_index(),
                    reloaded.symbol(),
                    reloaded.window_start(),
                    reloaded.window_end()
                );
                self.pause();
                None
            }
            Err(e) => {
                log::error!("FATAL: window reload for {} failed: {}", context.symbol(), e);
                self.pause();
                None
            }
        }
    }
}
