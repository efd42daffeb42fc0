//! Device state — an open map from string keys to loosely typed values.
//!
//! JSON numbers always decode to `serde_json::Number`, so `1`, `1.0` and
//! `1u64` must compare equal everywhere state values are compared
//! (diffing, rule conditions). All comparisons go through [`value_eq`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compare two JSON values with numeric tolerance: numbers are compared
/// as `f64` regardless of integer/float representation.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// State of a single device: `{"on": true, "brightness": 75.0, ...}`.
///
/// Merge semantics are right-biased last-write-wins; keys are never
/// implicitly deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub BTreeMap<String, Value>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    // ── Typed accessors ──────────────────────────────────────────────

    /// The value at `key`, if present and a bool.
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// The value at `key`, if present and numeric.
    pub fn float(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    /// The value at `key`, if present and a string.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    // ── Diff / merge ─────────────────────────────────────────────────

    /// Keys whose value changed or is new in `right`.
    ///
    /// Keys present in `self` but absent from `right` are NOT reported:
    /// a partial update never reads as a delete.
    pub fn diff(&self, right: &State) -> State {
        let mut out = State::new();
        for (k, v) in &right.0 {
            match self.0.get(k) {
                Some(old) if value_eq(old, v) => {}
                _ => {
                    out.0.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }

    /// A new state containing `self` overlaid with `right` (right wins).
    pub fn merge(&self, right: &State) -> State {
        let mut out = self.clone();
        out.merge_with(right);
        out
    }

    /// Overlay `right` onto `self` in place (right wins).
    pub fn merge_with(&mut self, right: &State) {
        for (k, v) in &right.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl PartialEq for State {
    /// Identical key sets, values compared with numeric tolerance.
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .all(|(k, v)| other.0.get(k).is_some_and(|o| value_eq(v, o)))
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
