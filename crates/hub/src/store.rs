//! Canonical store: devices, nodes, and saved states.
//!
//! All mutations happen behind the store's own locks; callers take a
//! snapshot right after mutating and broadcast that, so a broadcast
//! always reflects a consistent state, never a partial merge. The lock
//! is never held across channel sends or disk I/O for collections that
//! change at device-report frequency.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use hearth_domain::{Device, DeviceId, DeviceList, Node, Result, SavedState, SavedStateStore};
use hearth_protocol::StateChange;

use crate::persist;

const CONFIGS_DIR: &str = "configs";

pub struct Store {
    data_dir: PathBuf,
    devices: RwLock<DeviceList>,
    nodes: RwLock<HashMap<String, Node>>,
    savedstates: RwLock<SavedStateStore>,
}

impl Store {
    /// Load persisted nodes (`configs/<uuid>.json`) and saved states
    /// (`savedstate.json`) from the data directory. Devices always start
    /// empty; they exist only while their node reports them.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let savedstates: SavedStateStore =
            persist::load_json(&data_dir.join(persist::SAVEDSTATE_FILE))?;

        let mut nodes = HashMap::new();
        let configs = data_dir.join(CONFIGS_DIR);
        if configs.is_dir() {
            for entry in std::fs::read_dir(&configs)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    match persist::load_json::<Node>(&path) {
                        Ok(mut node) => {
                            node.connected = false;
                            nodes.insert(node.uuid.clone(), node);
                        }
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable node config");
                        }
                    }
                }
            }
        }
        tracing::info!(
            nodes = nodes.len(),
            savedstates = savedstates.len(),
            "store loaded"
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            devices: RwLock::new(DeviceList::new()),
            nodes: RwLock::new(nodes),
            savedstates: RwLock::new(savedstates),
        })
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub fn devices(&self) -> DeviceList {
        self.devices.read().clone()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    /// Upsert by `(node, id)`. Returns whether anything observable
    /// changed — an unchanged re-report (a node polling at high
    /// frequency) must not cause a downstream broadcast.
    pub fn add_or_update_device(&self, device: Device) -> bool {
        let mut devices = self.devices.write();
        let changed = match devices.get(&device.id) {
            Some(old) => {
                let diff = old.state.diff(&device.state);
                !diff.is_empty()
                    || old.online != device.online
                    || old.name != device.name
                    || old.alias != device.alias
                    || old.device_type != device.device_type
                    || old.traits != device.traits
            }
            None => true,
        };
        devices.add(device);
        changed
    }

    /// Merge partial state into existing devices, leaving unrelated keys
    /// untouched. Unknown device ids are skipped. Returns the ids whose
    /// state actually changed.
    pub fn sync_state(&self, change: &StateChange) -> Vec<DeviceId> {
        let mut devices = self.devices.write();
        let mut changed = Vec::new();
        for (id, state) in change {
            match devices.get_mut(id) {
                Some(dev) => {
                    let diff = dev.state.diff(state);
                    if !diff.is_empty() {
                        dev.state.merge_with(&diff);
                        changed.push(id.clone());
                    }
                }
                None => {
                    tracing::debug!(device = %id, "sync-state for unknown device, skipping");
                }
            }
        }
        changed
    }

    /// The online-flag cascade: a node session disappeared, so every
    /// device it owns is forced offline. Devices of other nodes are
    /// untouched. Returns how many devices were flagged.
    pub fn node_disconnected(&self, node_uuid: &str) -> usize {
        if let Some(node) = self.nodes.write().get_mut(node_uuid) {
            node.connected = false;
        }

        let mut devices = self.devices.write();
        let owned: Vec<DeviceId> = devices
            .iter()
            .filter(|(id, dev)| id.node == node_uuid && dev.online)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &owned {
            if let Some(dev) = devices.get_mut(id) {
                dev.online = false;
            }
        }
        owned.len()
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub fn nodes(&self) -> Vec<Node> {
        let mut out: Vec<Node> = self.nodes.read().values().cloned().collect();
        out.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        out
    }

    pub fn node(&self, uuid: &str) -> Option<Node> {
        self.nodes.read().get(uuid).cloned()
    }

    /// Merge an announced node into the stored record (empty update
    /// fields never wipe stored configuration) and persist it to
    /// `configs/<uuid>.json`. Returns the merged record.
    pub fn update_node(&self, update: Node) -> Result<Node> {
        let merged = {
            let mut nodes = self.nodes.write();
            let entry = nodes.entry(update.uuid.clone()).or_insert_with(|| Node {
                uuid: update.uuid.clone(),
                ..Default::default()
            });
            entry.merge_update(&update);
            entry.connected = update.connected;
            entry.clone()
        };
        persist::save_json(
            &self.data_dir.join(CONFIGS_DIR).join(format!("{}.json", merged.uuid)),
            &merged,
        )?;
        Ok(merged)
    }

    pub fn set_node_connected(&self, uuid: &str, connected: bool) {
        if let Some(node) = self.nodes.write().get_mut(uuid) {
            node.connected = connected;
        }
    }

    /// Store operator edits to a node's config map and persist them.
    pub fn set_node_config(&self, uuid: &str, config: HashMap<String, String>) -> Result<Option<Node>> {
        let updated = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(uuid) {
                Some(node) => {
                    node.config = config;
                    Some(node.clone())
                }
                None => None,
            }
        };
        if let Some(node) = &updated {
            persist::save_json(
                &self.data_dir.join(CONFIGS_DIR).join(format!("{}.json", node.uuid)),
                node,
            )?;
        }
        Ok(updated)
    }

    // ── Saved states ─────────────────────────────────────────────────

    pub fn savedstates(&self) -> SavedStateStore {
        self.savedstates.read().clone()
    }

    pub fn savedstate(&self, uuid: &str) -> Option<SavedState> {
        self.savedstates.read().get(uuid).cloned()
    }

    /// Replace the whole collection (gui edit) and persist it.
    pub fn replace_savedstates(&self, states: SavedStateStore) -> Result<()> {
        *self.savedstates.write() = states;
        let snapshot = self.savedstates.read().clone();
        persist::save_json(&self.data_dir.join(persist::SAVEDSTATE_FILE), &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path()).unwrap();
        (dir, store)
    }

    fn dev(node: &str, id: &str, online: bool, state: serde_json::Value) -> Device {
        Device {
            device_type: "light".into(),
            id: DeviceId::new(node, id),
            name: format!("{node}-{id}"),
            alias: String::new(),
            online,
            state: serde_json::from_value(state).unwrap(),
            traits: vec![],
        }
    }

    #[test]
    fn unchanged_re_report_does_not_flag_a_change() {
        let (_dir, store) = store();
        assert!(store.add_or_update_device(dev("n1", "1", true, json!({"on": false}))));
        assert!(!store.add_or_update_device(dev("n1", "1", true, json!({"on": false}))));
        assert!(store.add_or_update_device(dev("n1", "1", true, json!({"on": true}))));
    }

    #[test]
    fn sync_state_merges_known_devices_and_skips_unknown() {
        let (_dir, store) = store();
        store.add_or_update_device(dev("n1", "1", true, json!({"on": false, "brightness": 40.0})));

        let mut change = StateChange::new();
        change.insert(
            DeviceId::new("n1", "1"),
            serde_json::from_value(json!({"on": true})).unwrap(),
        );
        change.insert(
            DeviceId::new("n9", "9"),
            serde_json::from_value(json!({"on": true})).unwrap(),
        );

        let changed = store.sync_state(&change);
        assert_eq!(changed, vec![DeviceId::new("n1", "1")]);

        let devices = store.devices();
        let d = devices.get(&DeviceId::new("n1", "1")).unwrap();
        assert_eq!(d.state.bool("on"), Some(true));
        assert_eq!(d.state.float("brightness"), Some(40.0));
    }

    #[test]
    fn online_cascade_only_touches_the_disconnected_node() {
        let (_dir, store) = store();
        store.add_or_update_device(dev("n1", "1", true, json!({})));
        store.add_or_update_device(dev("n1", "2", true, json!({})));
        store.add_or_update_device(dev("n2", "1", true, json!({})));

        assert_eq!(store.node_disconnected("n1"), 2);

        let devices = store.devices();
        assert!(!devices.get(&DeviceId::new("n1", "1")).unwrap().online);
        assert!(!devices.get(&DeviceId::new("n1", "2")).unwrap().online);
        assert!(devices.get(&DeviceId::new("n2", "1")).unwrap().online);

        // Already-offline devices are not re-counted.
        assert_eq!(store.node_disconnected("n1"), 0);
    }

    #[test]
    fn update_node_persists_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::load(dir.path()).unwrap();
            store
                .update_node(Node {
                    uuid: "u1".into(),
                    node_type: "knx".into(),
                    name: "Basement".into(),
                    connected: true,
                    version: "1.0".into(),
                    config: HashMap::from([("gw".to_string(), "10.0.0.2".to_string())]),
                })
                .unwrap();
        }

        let store = Store::load(dir.path()).unwrap();
        let node = store.node("u1").unwrap();
        assert_eq!(node.name, "Basement");
        assert_eq!(node.config["gw"], "10.0.0.2");
        // Stored nodes come back disconnected.
        assert!(!node.connected);
    }

    #[test]
    fn sparse_update_node_keeps_stored_config() {
        let (_dir, store) = store();
        store
            .update_node(Node {
                uuid: "u1".into(),
                node_type: "knx".into(),
                config: HashMap::from([("gw".to_string(), "10.0.0.2".to_string())]),
                ..Default::default()
            })
            .unwrap();
        store
            .update_node(Node {
                uuid: "u1".into(),
                version: "2.0".into(),
                connected: true,
                ..Default::default()
            })
            .unwrap();

        let node = store.node("u1").unwrap();
        assert_eq!(node.version, "2.0");
        assert_eq!(node.config["gw"], "10.0.0.2");
        assert!(node.connected);
    }

    #[test]
    fn savedstates_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::load(dir.path()).unwrap();
            let mut states = SavedStateStore::new();
            states.add(SavedState {
                name: "evening".into(),
                uuid: "s1".into(),
                state: HashMap::new(),
            });
            store.replace_savedstates(states).unwrap();
        }
        let store = Store::load(dir.path()).unwrap();
        assert!(store.savedstate("s1").is_some());
    }
}
