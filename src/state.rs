//! Persisted session state
//!
//! Shape: `{ "lastActiveSymbol": ..., "symbolStates": { "<SYMBOL>": { "headIndex": n, ... } } }`.
//! Any extra per-symbol keys (drawings, notes) are kept verbatim.

use crate::error::ReplayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything needed to resume a multi-symbol replay session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub last_active_symbol: Option<String>,
    #[serde(default)]
    pub symbol_states: BTreeMap<String, SymbolState>,
}

/// Persisted state for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolState {
    pub head_index: usize,
    /// Symbol-scoped annotations; opaque to the engine
    #[serde(flatten)]
    pub annotations: Map<String, Value>,
}

impl SymbolState {
    pub fn new(head_index: usize) -> Self {
        SymbolState {
            head_index,
            annotations: Map::new(),
        }
    }
}

impl PersistedState {
    /// Reads state from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReplayError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes state as JSON, replacing the file atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ReplayError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| ReplayError::Persistence(format!("{}: {}", path.display(), e)))
    }
}

/// Outcome of restoring a [`PersistedState`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Symbols whose context was recreated
    pub restored: Vec<String>,
    /// Symbols skipped because their store could not be resolved or opened
    pub skipped: Vec<String>,
    /// Symbol active after the restore
    pub active: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_annotations_round_trip_untouched() {
        let raw = json!({
            "lastActiveSymbol": "EURUSD",
            "symbolStates": {
                "EURUSD": { "headIndex": 42, "drawings": [{"kind": "hline", "price": 1.1}] },
                "GBPUSD": { "headIndex": 7 }
            }
        });

        let state: PersistedState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.last_active_symbol.as_deref(), Some("EURUSD"));
        assert_eq!(state.symbol_states["EURUSD"].head_index, 42);
        assert!(state.symbol_states["EURUSD"].annotations.contains_key("drawings"));
        assert!(state.symbol_states["GBPUSD"].annotations.is_empty());

        assert_eq!(serde_json::to_value(&state).unwrap(), raw);
    }

    #[test]
    fn test_empty_object_is_empty_state() {
        let state: PersistedState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("replay-state-{}.json", uuid::Uuid::new_v4()));
        let mut state = PersistedState {
            last_active_symbol: Some("EURUSD".to_string()),
            ..PersistedState::default()
        };
        state
            .symbol_states
            .insert("EURUSD".to_string(), SymbolState::new(99));

        state.save(&path).unwrap();
        let loaded = PersistedState::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            PersistedState::load("/no/such/state.json"),
            Err(ReplayError::Persistence(_))
        ));
    }
}
