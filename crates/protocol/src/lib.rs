//! Hearth wire protocol: the JSON envelope exchanged over the upgraded
//! websocket connection, plus the typed payloads of the bootstrap flow.
//!
//! Every frame is a `{"type": "<string>", "body": <raw JSON>}` envelope.
//! Two client classes share the endpoint, distinguished by the declared
//! `Sec-WebSocket-Protocol`: driver processes connect as `node`, observers
//! as `gui`.

use std::collections::HashMap;

use hearth_domain::{DeviceId, State};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Body of a `state-change` message: desired state keyed by device,
/// already scoped to the devices of a single receiving node.
pub type StateChange = HashMap<DeviceId, State>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message type names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reserved envelope type names. Handlers register on these strings;
/// anything else is forwarded to whoever subscribed to it.
pub mod types {
    /// Hub → anonymous node, pushed immediately on insecure connect.
    pub const SERVER_INFO: &str = "server-info";
    /// Node → hub, PKCS#10 CSR during bootstrap.
    pub const CERTIFICATE_SIGNING_REQUEST: &str = "certificate-signing-request";
    /// Hub → node, the signed leaf certificate (PEM).
    pub const APPROVED_CSR: &str = "approved-certificate-signing-request";
    /// Hub → node, the CA root certificate (PEM).
    pub const CERTIFICATE_AUTHORITY: &str = "certificate-authority";
    /// Node → hub, announce/refresh node metadata.
    pub const UPDATE_NODE: &str = "update-node";
    /// Node → hub, a single device upsert.
    pub const UPDATE_DEVICE: &str = "update-device";
    /// Node → hub, a batch of device upserts.
    pub const UPDATE_DEVICES: &str = "update-devices";
    /// Hub → node (or gui → hub), request devices to assume a state.
    pub const STATE_CHANGE: &str = "state-change";
    /// Hub → node, stored node configuration.
    pub const SETUP: &str = "setup";
    /// Gui → hub, operator edit of a node's configuration map.
    pub const SETUP_NODE: &str = "setup-node";
    /// Any client → hub, declare broadcast topics of interest.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Hub → gui broadcasts on store mutation.
    pub const NODES: &str = "nodes";
    pub const DEVICES: &str = "devices";
    pub const CONNECTIONS: &str = "connections";
    pub const RULES: &str = "rules";
    pub const SCHEDULE: &str = "schedule";
    pub const SAVEDSTATES: &str = "savedstates";
    /// Hub → gui, a notification emitted by an action step.
    pub const NOTIFICATION: &str = "notification";
    /// Gui → hub, replace the persisted collections.
    pub const UPDATE_RULES: &str = "update-rules";
    pub const UPDATE_SCHEDULE: &str = "update-schedule";
    pub const UPDATE_SAVEDSTATES: &str = "update-savedstates";
    /// Request/response terminators.
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The wire envelope. `body` stays raw until a handler decodes it, so
/// dispatch never pays for payloads it does not understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<RawValue>>,
    /// Correlation id for request/response pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<u64>,
}

impl Message {
    /// Build an envelope with a serialized body.
    pub fn new<T: Serialize>(
        message_type: &str,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        let raw = serde_json::value::to_raw_value(body)?;
        Ok(Self {
            message_type: message_type.to_string(),
            body: Some(raw),
            request: None,
        })
    }

    /// Build an envelope with no body.
    pub fn empty(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_string(),
            body: None,
            request: None,
        }
    }

    pub fn with_request(mut self, id: u64) -> Self {
        self.request = Some(id);
        self
    }

    /// Parse one frame of wire text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode the body into a concrete payload type. A missing body
    /// decodes as JSON `null`, which only succeeds for types accepting it.
    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        match &self.body {
            Some(raw) => serde_json::from_str(raw.get()),
            None => serde_json::from_str("null"),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bootstrap payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pushed by the hub the moment an anonymous connection is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub uuid: String,
    pub port: u16,
    pub tls_port: u16,
}

/// Body of `certificate-signing-request`: the CSR plus enough metadata
/// for an operator to recognize the requesting node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub version: String,
    /// PEM-encoded PKCS#10 request; its Common Name is the node's
    /// freshly generated UUID.
    pub csr: String,
}
