//! Named state snapshots, replayable by rules and the scheduler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::state::State;

/// A named snapshot of desired state for a set of devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    pub name: String,
    pub uuid: String,
    #[serde(default)]
    pub state: HashMap<DeviceId, State>,
}

/// UUID-indexed snapshot collection; the arena other components hold
/// UUIDs into instead of pointers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SavedStateStore {
    states: HashMap<String, SavedState>,
}

impl SavedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &str) -> Option<&SavedState> {
        self.states.get(uuid)
    }

    pub fn add(&mut self, state: SavedState) {
        self.states.insert(state.uuid.clone(), state);
    }

    pub fn remove(&mut self, uuid: &str) -> Option<SavedState> {
        self.states.remove(uuid)
    }

    pub fn all(&self) -> &HashMap<String, SavedState> {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn savedstate_json_round_trip() {
        let mut store = SavedStateStore::new();
        let mut state = HashMap::new();
        state.insert(
            DeviceId::new("n1", "1"),
            serde_json::from_value::<State>(json!({"on": true})).unwrap(),
        );
        store.add(SavedState {
            name: "movie night".into(),
            uuid: "s1".into(),
            state,
        });

        let text = serde_json::to_string_pretty(&store).unwrap();
        let back: SavedStateStore = serde_json::from_str(&text).unwrap();
        let snap = back.get("s1").unwrap();
        assert_eq!(snap.name, "movie night");
        assert_eq!(
            snap.state[&DeviceId::new("n1", "1")].bool("on"),
            Some(true)
        );
    }
}
