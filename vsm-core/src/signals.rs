use crate::types::{SignalId, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

// ─── Signal store ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalState {
    pub value: Value,
    pub last_update: Timestamp,
}

/// Current value per signal name. Signals appear on first observation and
/// live for the rest of the process.
#[derive(Default)]
pub struct SignalStore {
    signals: HashMap<String, SignalState>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update a signal; returns true iff the value is distinct from the
    /// prior one. Re-evaluation is driven by every update regardless —
    /// the flag exists for logging and capture diagnostics.
    pub fn set(&mut self, name: &str, value: Value, ts: Timestamp) -> bool {
        match self.signals.get_mut(name) {
            Some(state) => {
                let changed = state.value != value;
                state.value = value;
                state.last_update = ts;
                changed
            }
            None => {
                self.signals.insert(
                    name.to_string(),
                    SignalState {
                        value,
                        last_update: ts,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Value {
        self.signals
            .get(name)
            .map(|s| s.value.clone())
            .unwrap_or(Value::Undefined)
    }

    pub fn last_update(&self, name: &str) -> Option<Timestamp> {
        self.signals.get(name).map(|s| s.last_update)
    }
}

// ─── Signal-number mapping ────────────────────────────────────

#[derive(Debug, Error)]
pub enum MapError {
    #[error("line {line}: expected `name id`, got `{text}`")]
    Malformed { line: usize, text: String },
    #[error("line {line}: invalid signal id `{text}`")]
    BadId { line: usize, text: String },
    #[error("line {line}: duplicate signal name `{name}`")]
    DuplicateName { line: usize, name: String },
    #[error("line {line}: duplicate signal id {id}")]
    DuplicateId { line: usize, id: SignalId },
}

/// Bidirectional name ↔ numeric-id translation, loaded from the
/// line-oriented `name id` mapping file (`#` comments allowed).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignalMap {
    by_name: BTreeMap<String, SignalId>,
    by_id: BTreeMap<SignalId, String>,
}

impl SignalMap {
    pub fn parse(text: &str) -> Result<Self, MapError> {
        let mut map = SignalMap::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let body = raw.split('#').next().unwrap_or("").trim();
            if body.is_empty() {
                continue;
            }
            let mut parts = body.split_whitespace();
            let (name, id_text) = match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(id), None) => (name, id),
                _ => {
                    return Err(MapError::Malformed {
                        line,
                        text: body.to_string(),
                    })
                }
            };
            let id: SignalId = id_text.parse().map_err(|_| MapError::BadId {
                line,
                text: id_text.to_string(),
            })?;
            if map.by_name.contains_key(name) {
                return Err(MapError::DuplicateName {
                    line,
                    name: name.to_string(),
                });
            }
            if map.by_id.contains_key(&id) {
                return Err(MapError::DuplicateId { line, id });
            }
            map.by_name.insert(name.to_string(), id);
            map.by_id.insert(id, name.to_string());
        }
        Ok(map)
    }

    pub fn id_of(&self, name: &str) -> Option<SignalId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: SignalId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_change() {
        let mut store = SignalStore::new();
        assert!(store.set("a", Value::Int(1), 0));
        assert!(!store.set("a", Value::Int(1), 5));
        assert!(store.set("a", Value::Int(2), 9));
        assert_eq!(store.get("a"), Value::Int(2));
        assert_eq!(store.last_update("a"), Some(9));
    }

    #[test]
    fn unknown_signal_is_undefined() {
        let store = SignalStore::new();
        assert_eq!(store.get("never.seen"), Value::Undefined);
    }

    #[test]
    fn map_parses_comments_and_blanks() {
        let map = SignalMap::parse(
            "# vehicle signals\n\ntransmission.gear 13\ncamera.backup.active 42 # rear cam\n",
        )
        .unwrap();
        assert_eq!(map.id_of("transmission.gear"), Some(13));
        assert_eq!(map.name_of(42), Some("camera.backup.active"));
        assert!(!map.contains("lights.external.headlights"));
    }

    #[test]
    fn map_rejects_duplicates() {
        assert!(matches!(
            SignalMap::parse("a 1\na 2\n"),
            Err(MapError::DuplicateName { .. })
        ));
        assert!(matches!(
            SignalMap::parse("a 1\nb 1\n"),
            Err(MapError::DuplicateId { .. })
        ));
    }

    #[test]
    fn map_rejects_malformed_lines() {
        assert!(matches!(
            SignalMap::parse("a\n"),
            Err(MapError::Malformed { .. })
        ));
        assert!(matches!(
            SignalMap::parse("a one\n"),
            Err(MapError::BadId { .. })
        ));
    }
}
