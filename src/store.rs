use crate::bar::{Bar, DataSource};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Random-access view over one symbol's ordered bar series.
///
/// A handle is bound to a single symbol/timeframe when it is opened, so the
/// methods take only positional arguments. Implementations must be shareable
/// across threads: the same handle is referenced by every copy of a replay
/// context for that symbol.
pub trait BarStore: Send + Sync {
    /// Total number of bars available.
    fn count(&self) -> Result<usize, StoreError>;

    /// Retrieves up to `count` bars starting at absolute index `start`.
    ///
    /// Returns fewer bars when the range runs past the end of the series.
    fn fetch_range(&self, start: usize, count: usize) -> Result<Vec<Bar>, StoreError>;

    /// Index of the first bar whose timestamp is at or after `instant`.
    ///
    /// Returns `Ok(None)` when every bar is earlier than `instant`.
    fn nearest_index_for_timestamp(
        &self,
        instant: DateTime<Utc>,
    ) -> Result<Option<usize>, StoreError>;

    /// Releases the underlying connection. Later calls return `StoreError::Closed`.
    fn close(&self);
}

/// Opens backing stores for data sources.
pub trait StoreOpener: Send + Sync {
    /// Opens the store described by `source`.
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the store is missing or cannot be opened.
    fn open(&self, source: &DataSource) -> Result<Arc<dyn BarStore>, StoreError>;
}

/// Resolves symbol names to data sources.
pub trait SymbolCatalog: Send + Sync {
    /// Returns the source for `symbol`, or `None` if the catalog doesn't know it.
    fn resolve(&self, symbol: &str) -> Option<DataSource>;

    /// All symbols the catalog can resolve, sorted.
    fn symbols(&self) -> Vec<String>;
}

/// Errors that can occur when talking to a backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store is missing or could not be opened
    Unavailable(String),
    /// Handle was closed
    Closed,
    /// Error reported by the storage backend
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Closed => write!(f, "Store handle is closed"),
            StoreError::Backend(msg) => write!(f, "Store backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// In-memory bar store for testing.
#[derive(Debug)]
pub struct InMemoryBarStore {
    bars: Arc<Vec<Bar>>,
    closed: AtomicBool,
}

impl InMemoryBarStore {
    /// Creates a store over `bars` (should be sorted by timestamp).
    pub fn new(bars: Vec<Bar>) -> Self {
        InMemoryBarStore::shared(Arc::new(bars))
    }

    fn shared(bars: Arc<Vec<Bar>>) -> Self {
        InMemoryBarStore {
            bars,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl BarStore for InMemoryBarStore {
    fn count(&self) -> Result<usize, StoreError> {
        self.ensure_open()?;
        Ok(self.bars.len())
    }

    fn fetch_range(&self, start: usize, count: usize) -> Result<Vec<Bar>, StoreError> {
        self.ensure_open()?;
        let start = start.min(self.bars.len());
        let end = start.saturating_add(count).min(self.bars.len());
        Ok(self.bars[start..end].to_vec())
    }

    fn nearest_index_for_timestamp(
        &self,
        instant: DateTime<Utc>,
    ) -> Result<Option<usize>, StoreError> {
        self.ensure_open()?;
        let index = self.bars.partition_point(|bar| bar.timestamp < instant);
        Ok((index < self.bars.len()).then_some(index))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory symbol catalog and store opener.
///
/// Keeps one bar series per symbol and remembers every handle it opened so
/// tests can check that handles get closed.
pub struct InMemoryMarket {
    timeframe: String,
    series: BTreeMap<String, Arc<Vec<Bar>>>,
    unavailable: HashSet<String>,
    opened: Mutex<Vec<Arc<InMemoryBarStore>>>,
}

impl InMemoryMarket {
    /// Creates an empty market serving bars at `timeframe`.
    pub fn new(timeframe: impl Into<String>) -> Self {
        InMemoryMarket {
            timeframe: timeframe.into(),
            series: BTreeMap::new(),
            unavailable: HashSet::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Adds a bar series for `symbol`, replacing any existing one.
    pub fn add_series(&mut self, symbol: impl Into<String>, bars: Vec<Bar>) {
        let symbol = symbol.into();
        self.unavailable.remove(&symbol);
        self.series.insert(symbol, Arc::new(bars));
    }

    /// Registers a symbol the catalog resolves but whose store fails to open.
    pub fn add_unavailable(&mut self, symbol: impl Into<String>) {
        let symbol = symbol.into();
        self.series.remove(&symbol);
        self.unavailable.insert(symbol);
    }

    /// Number of handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|store| !store.is_closed())
            .count()
    }
}

impl SymbolCatalog for InMemoryMarket {
    fn resolve(&self, symbol: &str) -> Option<DataSource> {
        if self.series.contains_key(symbol) || self.unavailable.contains(symbol) {
            Some(DataSource::in_memory(symbol, self.timeframe.clone()))
        } else {
            None
        }
    }

    fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .series
            .keys()
            .chain(self.unavailable.iter())
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }
}

impl StoreOpener for InMemoryMarket {
    fn open(&self, source: &DataSource) -> Result<Arc<dyn BarStore>, StoreError> {
        if source.timeframe != self.timeframe {
            return Err(StoreError::Unavailable(format!(
                "no {} bars for {}",
                source.timeframe, source.symbol
            )));
        }

        let bars = self
            .series
            .get(&source.symbol)
            .ok_or_else(|| StoreError::Unavailable(source.to_string()))?;

        let store = Arc::new(InMemoryBarStore::shared(Arc::clone(bars)));
        self.opened.lock().push(Arc::clone(&store));
        Ok(store as Arc<dyn BarStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn minute_bars(n: usize) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        (0..n)
            .map(|i| Bar::flat(base + Duration::minutes(i as i64), 100.0 + i as f64))
            .collect()
    }

    #[test]
    fn test_fetch_range_clamps_to_series_end() {
        let store = InMemoryBarStore::new(minute_bars(10));

        let bars = store.fetch_range(8, 5).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 108.0);

        assert!(store.fetch_range(20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_nearest_index_is_lower_bound() {
        let bars = minute_bars(10);
        let store = InMemoryBarStore::new(bars.clone());

        // Exact hit
        assert_eq!(
            store.nearest_index_for_timestamp(bars[3].timestamp).unwrap(),
            Some(3)
        );
        // Between bars rounds forward
        let between = bars[3].timestamp + Duration::seconds(30);
        assert_eq!(store.nearest_index_for_timestamp(between).unwrap(), Some(4));
        // Before the first bar
        let early = bars[0].timestamp - Duration::days(1);
        assert_eq!(store.nearest_index_for_timestamp(early).unwrap(), Some(0));
        // Past the end
        let late = bars[9].timestamp + Duration::minutes(1);
        assert_eq!(store.nearest_index_for_timestamp(late).unwrap(), None);
    }

    #[test]
    fn test_closed_store_rejects_reads() {
        let store = InMemoryBarStore::new(minute_bars(3));
        store.close();

        assert_eq!(store.count().unwrap_err(), StoreError::Closed);
        assert_eq!(store.fetch_range(0, 1).unwrap_err(), StoreError::Closed);
    }

    #[test]
    fn test_market_resolves_and_opens_known_symbols() {
        let mut market = InMemoryMarket::new("1m");
        market.add_series("EURUSD", minute_bars(5));
        market.add_unavailable("GBPUSD");

        assert_eq!(market.symbols(), vec!["EURUSD", "GBPUSD"]);
        assert!(market.resolve("USDJPY").is_none());

        let source = market.resolve("EURUSD").unwrap();
        let store = market.open(&source).unwrap();
        assert_eq!(store.count().unwrap(), 5);
        assert_eq!(market.open_handles(), 1);

        store.close();
        assert_eq!(market.open_handles(), 0);
    }

    #[test]
    fn test_market_unavailable_symbol_fails_to_open() {
        let mut market = InMemoryMarket::new("1m");
        market.add_unavailable("GBPUSD");

        let source = market.resolve("GBPUSD").unwrap();
        assert!(matches!(
            market.open(&source),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_market_rejects_other_timeframes() {
        let mut market = InMemoryMarket::new("1m");
        market.add_series("EURUSD", minute_bars(5));

        let source = DataSource::in_memory("EURUSD", "1h");
        assert!(matches!(
            market.open(&source),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::Closed.to_string(), "Store handle is closed");
        assert_eq!(
            StoreError::Unavailable("EURUSD@1m".to_string()).to_string(),
            "Store unavailable: EURUSD@1m"
        );
    }
}
