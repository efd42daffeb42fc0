//! Rule conditions: a flattened state path, a comparator, and a value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hearth_domain::value_eq;

use super::LogicError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

/// One predicate over the flattened device map. `state_path` addresses a
/// single state key as `"<node>.<device>.<key>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "statePath")]
    pub state_path: String,
    pub comparator: Comparator,
    pub value: Value,
}

impl Condition {
    /// Evaluate against a flattened state map. Unknown paths and
    /// non-numeric ordering comparisons are typed errors, never panics.
    pub fn eval(&self, flat: &HashMap<String, Value>) -> Result<bool, LogicError> {
        let actual = flat
            .get(&self.state_path)
            .ok_or_else(|| LogicError::UnknownStatePath(self.state_path.clone()))?;

        match self.comparator {
            Comparator::Eq => Ok(value_eq(actual, &self.value)),
            Comparator::Ne => Ok(!value_eq(actual, &self.value)),
            Comparator::Lt => {
                let (a, b) = self.as_floats(actual)?;
                Ok(a < b)
            }
            Comparator::Gt => {
                let (a, b) = self.as_floats(actual)?;
                Ok(a > b)
            }
        }
    }

    // Ordering comparators only make sense on numbers. JSON numbers
    // arrive as f64, so integer-looking values still compare correctly.
    fn as_floats(&self, actual: &Value) -> Result<(f64, f64), LogicError> {
        match (actual.as_f64(), self.value.as_f64()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(LogicError::NotComparable {
                path: self.state_path.clone(),
                actual: actual.clone(),
                expected: self.value.clone(),
            }),
        }
    }
}
