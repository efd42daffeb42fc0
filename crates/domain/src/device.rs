//! Devices and the compound `(node, device)` key that addresses them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::state::State;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DeviceId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compound device key: the owning node's UUID plus the node-local
/// device id. Serialized as `"<node-uuid>.<device-id>"` so it can be a
/// JSON object key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub node: String,
    pub id: String,
}

impl DeviceId {
    pub fn new(node: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.id)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The device-local id may itself contain dots; only the first
        // separates the node UUID.
        match s.split_once('.') {
            Some((node, id)) if !node.is_empty() && !id.is_empty() => Ok(Self {
                node: node.to_string(),
                id: id.to_string(),
            }),
            _ => Err(Error::InvalidDeviceId(s.to_string())),
        }
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One controllable/observable entity reported by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type", default)]
    pub device_type: String,
    pub id: DeviceId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "State::is_empty")]
    pub state: State,
    #[serde(default)]
    pub traits: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DeviceList
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map of devices keyed by [`DeviceId`]; at most one device per key.
///
/// Plain data — callers that share a list across tasks wrap it in a lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceList {
    devices: HashMap<DeviceId, Device>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by id.
    pub fn add(&mut self, device: Device) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Replace a known device's state wholesale.
    pub fn set_state(&mut self, id: &DeviceId, state: State) -> Result<(), Error> {
        match self.devices.get_mut(id) {
            Some(dev) => {
                dev.state = state;
                Ok(())
            }
            None => Err(Error::DeviceNotFound(id.clone())),
        }
    }

    pub fn all(&self) -> &HashMap<DeviceId, Device> {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &Device)> {
        self.devices.iter()
    }

    /// Flatten every state key to `"<node>.<device>.<key>"` — the
    /// addressing used by rule condition state paths.
    pub fn flatten(&self) -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::new();
        for (id, dev) in &self.devices {
            for (key, value) in dev.state.iter() {
                out.insert(format!("{id}.{key}"), value.clone());
            }
        }
        out
    }

    /// Group every device's state by owning node UUID — the shape used
    /// to batch `state-change` messages, one per node.
    pub fn state_grouped_by_node(&self) -> HashMap<String, HashMap<DeviceId, State>> {
        let mut out: HashMap<String, HashMap<DeviceId, State>> = HashMap::new();
        for (id, dev) in &self.devices {
            out.entry(id.node.clone())
                .or_default()
                .insert(id.clone(), dev.state.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dev(node: &str, id: &str, state: serde_json::Value) -> Device {
        Device {
            device_type: "light".into(),
            id: DeviceId::new(node, id),
            name: format!("{node}-{id}"),
            alias: String::new(),
            online: true,
            state: serde_json::from_value(state).unwrap(),
            traits: vec!["OnOff".into()],
        }
    }

    #[test]
    fn device_id_round_trips_as_string() {
        let id = DeviceId::new("aaaa-bbbb", "light.1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"aaaa-bbbb.light.1\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node, "aaaa-bbbb");
        assert_eq!(back.id, "light.1");
    }

    #[test]
    fn device_id_rejects_missing_separator() {
        assert!("no-separator".parse::<DeviceId>().is_err());
        assert!(".leading".parse::<DeviceId>().is_err());
        assert!("trailing.".parse::<DeviceId>().is_err());
    }

    #[test]
    fn add_is_an_upsert() {
        let mut list = DeviceList::new();
        list.add(dev("n1", "1", json!({"on": false})));
        list.add(dev("n1", "1", json!({"on": true})));
        assert_eq!(list.len(), 1);
        let d = list.get(&DeviceId::new("n1", "1")).unwrap();
        assert_eq!(d.state.bool("on"), Some(true));
    }

    #[test]
    fn set_state_on_unknown_device_is_a_typed_error() {
        let mut list = DeviceList::new();
        let err = list
            .set_state(&DeviceId::new("n1", "9"), State::new())
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[test]
    fn flatten_addresses_every_state_key() {
        let mut list = DeviceList::new();
        list.add(dev("n1", "1", json!({"on": true, "brightness": 50.0})));
        list.add(dev("n2", "1", json!({"temp": 21.0})));
        let flat = list.flatten();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat["n1.1.on"], json!(true));
        assert_eq!(flat["n2.1.temp"], json!(21.0));
    }

    #[test]
    fn state_grouped_by_node_splits_per_owner() {
        let mut list = DeviceList::new();
        list.add(dev("n1", "1", json!({"on": true})));
        list.add(dev("n1", "2", json!({"on": false})));
        list.add(dev("n2", "1", json!({"on": true})));
        let grouped = list.state_grouped_by_node();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["n1"].len(), 2);
        assert_eq!(grouped["n2"].len(), 1);
    }

    #[test]
    fn device_json_shape() {
        let d = dev("n1", "1", json!({"on": true}));
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["id"], "n1.1");
        assert_eq!(v["type"], "light");
        assert_eq!(v["online"], true);
        assert_eq!(v["state"]["on"], true);
    }
}
