//! Per-symbol replay state
//!
//! A [`ReplayContext`] is an immutable snapshot of one symbol's cursor and
//! resident window. Every change produces a new value that is swapped into the
//! [`ContextStore`] as a whole, so a reader holding an `Arc<ReplayContext>`
//! always sees a complete, consistent state.

use crate::bar::{Bar, DataSource};
use crate::store::{BarStore, StoreError, StoreOpener, SymbolCatalog};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Immutable replay state for one symbol.
#[derive(Clone)]
pub struct ReplayContext {
    source: DataSource,
    total_bar_count: usize,
    head_index: usize,
    /// Shared between copies so advancing the head never copies bars
    window: Arc<[Bar]>,
    window_start: usize,
    store: Arc<dyn BarStore>,
}

impl ReplayContext {
    /// Creates a context with an empty window.
    ///
    /// `start_index` is clamped into `[0, total_bar_count - 1]`.
    pub fn new(
        source: DataSource,
        store: Arc<dyn BarStore>,
        total_bar_count: usize,
        start_index: usize,
    ) -> Self {
        ReplayContext {
            source,
            total_bar_count,
            head_index: clamp_head(start_index, total_bar_count),
            window: Arc::from(Vec::new()),
            window_start: 0,
            store,
        }
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn symbol(&self) -> &str {
        &self.source.symbol
    }

    pub fn total_bar_count(&self) -> usize {
        self.total_bar_count
    }

    pub fn head_index(&self) -> usize {
        self.head_index
    }

    pub fn window(&self) -> &[Bar] {
        &self.window
    }

    pub fn window_start(&self) -> usize {
        self.window_start
    }

    /// One past the absolute index of the last resident bar.
    pub fn window_end(&self) -> usize {
        self.window_start + self.window.len()
    }

    pub fn store(&self) -> &Arc<dyn BarStore> {
        &self.store
    }

    /// Terminal state: the head sits on the last bar, or there are no bars.
    pub fn is_finished(&self) -> bool {
        self.total_bar_count == 0 || self.head_index + 1 >= self.total_bar_count
    }

    /// Whether `index` is resident in the current window.
    pub fn contains(&self, index: usize) -> bool {
        index >= self.window_start && index < self.window_end()
    }

    /// Whether the head's bar is resident.
    pub fn head_in_window(&self) -> bool {
        self.contains(self.head_index)
    }

    /// Bar at absolute `index` if it is resident.
    pub fn bar_at(&self, index: usize) -> Option<&Bar> {
        if self.contains(index) {
            self.window.get(index - self.window_start)
        } else {
            None
        }
    }

    /// The head's bar if it is resident.
    pub fn current_bar(&self) -> Option<&Bar> {
        self.bar_at(self.head_index)
    }

    /// Copy of this context with the head moved to `index` (clamped).
    ///
    /// The window is kept as-is; callers decide whether to reload it.
    pub fn with_head(&self, index: usize) -> Self {
        ReplayContext {
            head_index: clamp_head(index, self.total_bar_count),
            ..self.clone()
        }
    }

    /// Copy of this context with a freshly loaded window.
    pub fn with_window(&self, window_start: usize, bars: Vec<Bar>) -> Self {
        ReplayContext {
            window: Arc::from(bars),
            window_start,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ReplayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayContext")
            .field("source", &self.source)
            .field("total_bar_count", &self.total_bar_count)
            .field("head_index", &self.head_index)
            .field("window_start", &self.window_start)
            .field("window_len", &self.window.len())
            .finish()
    }
}

fn clamp_head(index: usize, total: usize) -> usize {
    index.min(total.saturating_sub(1))
}

fn same_store(a: &Arc<dyn BarStore>, b: &Arc<dyn BarStore>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Concurrent `symbol -> ReplayContext` map plus the active-symbol marker.
///
/// Owns the lifetime of every store handle: handles are opened by
/// [`ContextStore::create`] and closed only by [`ContextStore::remove`],
/// [`ContextStore::cleanup`], or when a different handle displaces them.
pub struct ContextStore {
    catalog: Arc<dyn SymbolCatalog>,
    opener: Arc<dyn StoreOpener>,
    contexts: RwLock<HashMap<String, Arc<ReplayContext>>>,
    active: RwLock<Option<String>>,
}

impl ContextStore {
    pub fn new(catalog: Arc<dyn SymbolCatalog>, opener: Arc<dyn StoreOpener>) -> Self {
        ContextStore {
            catalog,
            opener,
            contexts: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn SymbolCatalog> {
        &self.catalog
    }

    /// Opens the store for `source` and builds a context at `start_index`.
    ///
    /// The context is not inserted into the map.
    ///
    /// # Errors
    /// Returns the store error if the store can't be opened or counted. The
    /// failure is logged here so callers can simply fall back.
    pub fn create(&self, source: &DataSource, start_index: usize) -> Result<ReplayContext, StoreError> {
        let store = self.opener.open(source).map_err(|e| {
            log::warn!("Cannot open store for {}: {}", source, e);
            e
        })?;

        let total = match store.count() {
            Ok(total) => total,
            Err(e) => {
                log::warn!("Cannot count bars for {}: {}", source, e);
                store.close();
                return Err(e);
            }
        };

        if start_index >= total && total > 0 {
            log::debug!(
                "Clamping start index {} for {} to {}",
                start_index,
                source.symbol,
                total - 1
            );
        }

        Ok(ReplayContext::new(source.clone(), store, total, start_index))
    }

    /// Current context for `symbol`.
    pub fn get(&self, symbol: &str) -> Option<Arc<ReplayContext>> {
        self.contexts.read().get(symbol).cloned()
    }

    /// Stores `context`, replacing any existing one for its symbol.
    ///
    /// A displaced context holding a different store handle has that handle closed.
    pub fn replace(&self, context: ReplayContext) -> Arc<ReplayContext> {
        let context = Arc::new(context);
        let displaced = self
            .contexts
            .write()
            .insert(context.symbol().to_string(), Arc::clone(&context));

        if let Some(old) = displaced {
            if !same_store(old.store(), context.store()) {
                old.store().close();
            }
        }
        context
    }

    /// Stores `context` only if the entry is still `expected`.
    ///
    /// Returns the stored context, or `None` if another writer got there first.
    pub fn replace_if_current(
        &self,
        expected: &Arc<ReplayContext>,
        context: ReplayContext,
    ) -> Option<Arc<ReplayContext>> {
        let mut contexts = self.contexts.write();
        match contexts.get(expected.symbol()) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                let context = Arc::new(context);
                contexts.insert(context.symbol().to_string(), Arc::clone(&context));
                Some(context)
            }
            _ => None,
        }
    }

    /// Drops the context for `symbol` and closes its store.
    pub fn remove(&self, symbol: &str) -> bool {
        let removed = self.contexts.write().remove(symbol);
        let mut active = self.active.write();
        if active.as_deref() == Some(symbol) {
            *active = None;
        }
        drop(active);

        match removed {
            Some(context) => {
                context.store().close();
                true
            }
            None => false,
        }
    }

    pub fn active_symbol(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Context of the active symbol.
    pub fn active(&self) -> Option<Arc<ReplayContext>> {
        let symbol = self.active.read().clone()?;
        self.get(&symbol)
    }

    /// Marks `symbol` as active without any lookup. `None` clears it.
    pub fn set_active(&self, symbol: Option<String>) {
        *self.active.write() = symbol;
    }

    /// Activates `symbol`, creating its context on first use.
    ///
    /// If the symbol can't be resolved or its store can't be opened, falls
    /// back to the currently active symbol, then to any other known symbol,
    /// and finally to no active symbol.
    ///
    /// # Returns
    /// The symbol that ended up active.
    pub fn switch_active(&self, symbol: &str) -> Option<String> {
        if self.contexts.read().contains_key(symbol) {
            self.set_active(Some(symbol.to_string()));
            return Some(symbol.to_string());
        }

        match self.catalog.resolve(symbol) {
            Some(source) => {
                if let Ok(context) = self.create(&source, 0) {
                    self.replace(context);
                    self.set_active(Some(symbol.to_string()));
                    return Some(symbol.to_string());
                }
            }
            None => log::warn!("Symbol {} is not in the catalog", symbol),
        }

        let fallback = self
            .active_symbol()
            .filter(|active| self.contexts.read().contains_key(active))
            .or_else(|| self.symbols().into_iter().next());

        match &fallback {
            Some(other) => log::warn!("Falling back from {} to {}", symbol, other),
            None => log::warn!("No symbol available after failing to load {}", symbol),
        }
        self.set_active(fallback.clone());
        fallback
    }

    /// Symbols with a live context, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.contexts.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Closes every store handle and forgets all contexts.
    pub fn cleanup(&self) {
        let drained: Vec<Arc<ReplayContext>> =
            self.contexts.write().drain().map(|(_, context)| context).collect();
        self.set_active(None);

        if !drained.is_empty() {
            log::debug!("Closing {} replay contexts", drained.len());
        }
        for context in drained {
            context.store().close();
        }
    }
}

impl Drop for ContextStore {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMarket;
    use chrono::{Duration, TimeZone, Utc};

    fn minute_bars(n: usize) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        (0..n)
            .map(|i| Bar::flat(base + Duration::minutes(i as i64), i as f64))
            .collect()
    }

    fn market() -> Arc<InMemoryMarket> {
        let mut market = InMemoryMarket::new("1m");
        market.add_series("EURUSD", minute_bars(100));
        market.add_series("GBPUSD", minute_bars(50));
        market.add_unavailable("USDJPY");
        Arc::new(market)
    }

    fn store_for(market: &Arc<InMemoryMarket>) -> ContextStore {
        ContextStore::new(market.clone(), market.clone())
    }

    #[test]
    fn test_create_clamps_start_index() {
        let market = market();
        let store = store_for(&market);
        let source = market.resolve("GBPUSD").unwrap();

        let context = store.create(&source, 500).unwrap();
        assert_eq!(context.total_bar_count(), 50);
        assert_eq!(context.head_index(), 49);
        assert!(context.window().is_empty());
        assert!(context.is_finished());
    }

    #[test]
    fn test_create_unavailable_store_fails() {
        let market = market();
        let store = store_for(&market);
        let source = market.resolve("USDJPY").unwrap();

        assert!(store.create(&source, 0).is_err());
        assert_eq!(market.open_handles(), 0);
    }

    #[test]
    fn test_with_head_leaves_source_context_untouched() {
        let market = market();
        let store = store_for(&market);
        let context = store
            .create(&market.resolve("EURUSD").unwrap(), 10)
            .unwrap()
            .with_window(5, minute_bars(100)[5..15].to_vec());

        let moved = context.with_head(12);
        assert_eq!(context.head_index(), 10);
        assert_eq!(moved.head_index(), 12);
        assert_eq!(moved.window_start(), 5);
        assert_eq!(moved.current_bar().unwrap().close, 12.0);

        let past = context.with_head(15);
        assert!(!past.head_in_window());
        assert!(past.current_bar().is_none());
    }

    #[test]
    fn test_replace_if_current_detects_concurrent_writer() {
        let market = market();
        let store = store_for(&market);
        let first = store.replace(store.create(&market.resolve("EURUSD").unwrap(), 0).unwrap());

        let second = store.replace(first.with_head(1));
        assert!(store.replace_if_current(&first, first.with_head(5)).is_none());
        assert_eq!(store.get("EURUSD").unwrap().head_index(), 1);

        assert!(store.replace_if_current(&second, second.with_head(2)).is_some());
        assert_eq!(store.get("EURUSD").unwrap().head_index(), 2);
    }

    #[test]
    fn test_replace_with_same_store_keeps_handle_open() {
        let market = market();
        let store = store_for(&market);
        let context = store.replace(store.create(&market.resolve("EURUSD").unwrap(), 0).unwrap());

        store.replace(context.with_head(3));
        assert_eq!(market.open_handles(), 1);

        // A brand-new handle displaces and closes the old one
        store.replace(store.create(&market.resolve("EURUSD").unwrap(), 0).unwrap());
        assert_eq!(market.open_handles(), 1);
    }

    #[test]
    fn test_switch_active_creates_lazily() {
        let market = market();
        let store = store_for(&market);

        assert_eq!(store.switch_active("GBPUSD"), Some("GBPUSD".to_string()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.active().unwrap().head_index(), 0);
    }

    #[test]
    fn test_switch_active_falls_back_to_known_symbol() {
        let market = market();
        let store = store_for(&market);
        store.switch_active("EURUSD");

        assert_eq!(store.switch_active("USDJPY"), Some("EURUSD".to_string()));
        assert_eq!(store.switch_active("XAUUSD"), Some("EURUSD".to_string()));
        assert_eq!(store.active_symbol(), Some("EURUSD".to_string()));
    }

    #[test]
    fn test_switch_active_with_nothing_known_clears_active() {
        let market = market();
        let store = store_for(&market);

        assert_eq!(store.switch_active("XAUUSD"), None);
        assert_eq!(store.active_symbol(), None);
    }

    #[test]
    fn test_remove_closes_handle_and_clears_active() {
        let market = market();
        let store = store_for(&market);
        store.switch_active("EURUSD");

        assert!(store.remove("EURUSD"));
        assert!(!store.remove("EURUSD"));
        assert_eq!(store.active_symbol(), None);
        assert_eq!(market.open_handles(), 0);
    }

    #[test]
    fn test_cleanup_closes_every_handle() {
        let market = market();
        let store = store_for(&market);
        store.switch_active("EURUSD");
        store.switch_active("GBPUSD");
        assert_eq!(market.open_handles(), 2);

        store.cleanup();
        assert!(store.is_empty());
        assert_eq!(store.active_symbol(), None);
        assert_eq!(market.open_handles(), 0);
    }
}
