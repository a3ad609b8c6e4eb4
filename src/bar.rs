use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Open time of the bar
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Creates a new Bar.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Bar {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Creates a flat bar where open, high, low and close are all `price`.
    pub fn flat(timestamp: DateTime<Utc>, price: f64) -> Self {
        Bar::new(timestamp, price, price, price, price, 0.0)
    }
}

/// Where the bars for one symbol/timeframe live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSource {
    /// Symbol name (e.g. "EURUSD")
    pub symbol: String,
    /// Bar resolution, e.g. "1m"
    pub timeframe: String,
    /// Backing store location; empty for in-memory stores
    #[serde(default)]
    pub location: PathBuf,
}

impl DataSource {
    /// Creates a new source descriptor.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        location: impl Into<PathBuf>,
    ) -> Self {
        DataSource {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            location: location.into(),
        }
    }

    /// Creates a source with no on-disk location.
    pub fn in_memory(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        DataSource::new(symbol, timeframe, PathBuf::new())
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.as_os_str().is_empty() {
            write!(f, "{}@{}", self.symbol, self.timeframe)
        } else {
            write!(
                f,
                "{}@{} ({})",
                self.symbol,
                self.timeframe,
                self.location.display()
            )
        }
    }
}
