use crate::bar::{Bar, DataSource};
use crate::store::{BarStore, StoreError, StoreOpener, SymbolCatalog};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Result as SqliteResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SQLite-backed bar store for a single symbol.
///
/// Each symbol lives in its own database file with a `bars` table keyed by
/// `(timeframe, ts)`, where `ts` is the bar open time in epoch milliseconds.
/// Positional access is by `ORDER BY ts`.
#[derive(Debug)]
pub struct SqliteBarStore {
    /// `None` once the handle has been closed
    conn: Mutex<Option<Connection>>,
    timeframe: String,
}

impl SqliteBarStore {
    /// Opens an existing bar database read-only.
    ///
    /// # Arguments
    /// * `source` - Source whose `location` points at the database file
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` if the file is missing, can't be opened,
    /// or has no `bars` table.
    pub fn open(source: &DataSource) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            &source.location,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", source, e)))?;

        let has_bars = table_exists(&conn, "bars")
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", source, e)))?;
        if !has_bars {
            return Err(StoreError::Unavailable(format!(
                "{}: missing bars table",
                source
            )));
        }

        Ok(SqliteBarStore {
            conn: Mutex::new(Some(conn)),
            timeframe: source.timeframe.clone(),
        })
    }

    /// Creates (or opens) a writable bar database and ensures the schema exists.
    ///
    /// Used to seed data; replay itself only ever opens stores read-only.
    pub fn create<P: AsRef<Path>>(db_path: P, timeframe: impl Into<String>) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        ensure_schema(&conn)?;
        Ok(SqliteBarStore {
            conn: Mutex::new(Some(conn)),
            timeframe: timeframe.into(),
        })
    }

    /// Inserts bars for this store's timeframe in a single transaction.
    ///
    /// Bars with a timestamp already present are replaced.
    pub fn insert_bars(&self, bars: &[Bar]) -> Result<usize, StoreError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO bars (timeframe, ts, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                stmt.execute(params![
                    self.timeframe,
                    bar.timestamp.timestamp_millis(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;

        Ok(bars.len())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> SqliteResult<T>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(f(conn)?)
    }
}

impl BarStore for SqliteBarStore {
    fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM bars WHERE timeframe = ?1",
                [&self.timeframe],
                |row| row.get(0),
            )
        })?;
        Ok(count.max(0) as usize)
    }

    fn fetch_range(&self, start: usize, count: usize) -> Result<Vec<Bar>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ts, open, high, low, close, volume FROM bars
                 WHERE timeframe = ?1
                 ORDER BY ts
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt.query_map(
                params![self.timeframe, count as i64, start as i64],
                |row| {
                    let ts: i64 = row.get(0)?;
                    Ok(Bar::new(
                        millis_to_utc(ts)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )?;

            rows.collect()
        })
    }

    fn nearest_index_for_timestamp(
        &self,
        instant: DateTime<Utc>,
    ) -> Result<Option<usize>, StoreError> {
        let (earlier, total): (i64, i64) = self.with_conn(|conn| {
            let earlier = conn.query_row(
                "SELECT COUNT(*) FROM bars WHERE timeframe = ?1 AND ts < ?2",
                params![self.timeframe, instant.timestamp_millis()],
                |row| row.get(0),
            )?;
            let total = conn.query_row(
                "SELECT COUNT(*) FROM bars WHERE timeframe = ?1",
                [&self.timeframe],
                |row| row.get(0),
            )?;
            Ok((earlier, total))
        })?;

        Ok((earlier < total).then_some(earlier.max(0) as usize))
    }

    fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                log::warn!("Failed to close bar store cleanly: {}", e);
            }
        }
    }
}

/// Directory of per-symbol bar databases (`<data_dir>/<SYMBOL>.db`).
///
/// Serves as both the symbol catalog and the store opener for on-disk data.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    data_dir: PathBuf,
    timeframe: String,
}

impl SqliteCatalog {
    /// Creates a catalog over `data_dir` serving bars at `timeframe`.
    pub fn new(data_dir: impl Into<PathBuf>, timeframe: impl Into<String>) -> Self {
        SqliteCatalog {
            data_dir: data_dir.into(),
            timeframe: timeframe.into(),
        }
    }

    /// Path of the database file for `symbol`.
    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", symbol))
    }
}

impl SymbolCatalog for SqliteCatalog {
    fn resolve(&self, symbol: &str) -> Option<DataSource> {
        if !is_valid_symbol(symbol) {
            return None;
        }
        let path = self.path_for(symbol);
        path.is_file()
            .then(|| DataSource::new(symbol, self.timeframe.clone(), path))
    }

    fn symbols(&self) -> Vec<String> {
        let mut symbols = Vec::new();
        match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some("db") {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if is_valid_symbol(stem) {
                            symbols.push(stem.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "Cannot list symbols in {}: {}",
                    self.data_dir.display(),
                    e
                );
            }
        }
        symbols.sort();
        symbols
    }
}

impl StoreOpener for SqliteCatalog {
    fn open(&self, source: &DataSource) -> Result<Arc<dyn BarStore>, StoreError> {
        let store = SqliteBarStore::open(source)?;
        Ok(Arc::new(store))
    }
}

/// Ensures the bar schema exists, creating it if necessary.
fn ensure_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bars (
            timeframe TEXT NOT NULL,
            ts INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            PRIMARY KEY (timeframe, ts)
        )",
        [],
    )?;
    Ok(())
}

/// Checks if a table exists in the database.
fn table_exists(conn: &Connection, table_name: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
    stmt.exists([table_name])
}

fn millis_to_utc(ms: i64) -> SqliteResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

/// Symbols map straight onto file names, so only allow a safe character set.
fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_')
}
