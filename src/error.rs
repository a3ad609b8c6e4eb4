use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors surfaced by the replay engine
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// Backing store for a symbol could not be opened or read
    StoreUnavailable { symbol: String, reason: String },
    /// Symbol is not known to the catalog
    SymbolNotFound(String),
    /// Engine configuration is unusable
    InvalidConfig(String),
    /// Scheduler thread could not be started
    SchedulerUnavailable(String),
    /// Persisted state could not be read or written
    Persistence(String),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::StoreUnavailable { symbol, reason } => {
                write!(f, "Store unavailable for {}: {}", symbol, reason)
            }
            ReplayError::SymbolNotFound(symbol) => write!(f, "Unknown symbol: {}", symbol),
            ReplayError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            ReplayError::SchedulerUnavailable(msg) => {
                write!(f, "Scheduler unavailable: {}", msg)
            }
            ReplayError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
        }
    }
}

impl std::error::Error for ReplayError {}

impl ReplayError {
    pub(crate) fn store(symbol: &str, err: StoreError) -> Self {
        ReplayError::StoreUnavailable {
            symbol: symbol.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<ConfigError> for ReplayError {
    fn from(err: ConfigError) -> Self {
        ReplayError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(err: serde_json::Error) -> Self {
        ReplayError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_error_display() {
        let err = ReplayError::store("EURUSD", StoreError::Closed);
        assert_eq!(
            err.to_string(),
            "Store unavailable for EURUSD: Store handle is closed"
        );

        let err = ReplayError::SymbolNotFound("XAUUSD".to_string());
        assert_eq!(err.to_string(), "Unknown symbol: XAUUSD");
    }

    #[test]
    fn test_config_error_converts() {
        let err: ReplayError = ConfigError::Invalid("window_size".to_string()).into();
        assert!(matches!(err, ReplayError::InvalidConfig(_)));
    }
}
