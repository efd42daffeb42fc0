//! Nodes (driver processes) and live connections.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One external driver process. Identity is the UUID bound to the node's
/// TLS client certificate Common Name; created on first bootstrap and
/// never deleted (only flagged disconnected).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, String>,
}

impl Node {
    /// Overlay a freshly announced node onto the stored record. Empty
    /// fields in the update leave the stored value untouched, so a
    /// minimal `update-node` never wipes server-side configuration.
    pub fn merge_update(&mut self, update: &Node) {
        if !update.node_type.is_empty() {
            self.node_type = update.node_type.clone();
        }
        if !update.name.is_empty() {
            self.name = update.name.clone();
        }
        if !update.version.is_empty() {
            self.version = update.version.clone();
        }
        if !update.config.is_empty() {
            self.config = update.config.clone();
        }
    }
}

/// A live transport session, tagged with its declared protocol role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_update_keeps_stored_fields_when_update_is_sparse() {
        let mut stored = Node {
            uuid: "u1".into(),
            node_type: "knx".into(),
            name: "Basement".into(),
            connected: true,
            version: "1.0".into(),
            config: HashMap::from([("gateway".to_string(), "10.0.0.2".to_string())]),
        };
        let update = Node {
            uuid: "u1".into(),
            version: "1.1".into(),
            ..Default::default()
        };
        stored.merge_update(&update);
        assert_eq!(stored.version, "1.1");
        assert_eq!(stored.name, "Basement");
        assert_eq!(stored.config.len(), 1);
    }
}
