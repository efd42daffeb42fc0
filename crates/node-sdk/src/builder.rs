//! Builder pattern for constructing a [`NodeClient`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{NodeClient, Shared};
use crate::reconnect::ReconnectBackoff;
use crate::types::NodeSdkError;

/// Fluent builder for [`NodeClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use hearth_node_sdk::NodeClientBuilder;
/// let client = NodeClientBuilder::new("example")
///     .host("hearth.local")
///     .name("Example driver")
///     .version(env!("CARGO_PKG_VERSION"))
///     .data_dir("/var/lib/hearth-example")
///     .build()
///     .unwrap();
/// ```
pub struct NodeClientBuilder {
    host: String,
    port: u16,
    data_dir: PathBuf,
    node_type: String,
    name: String,
    version: String,
    heartbeat_interval: Duration,
    bootstrap_timeout: Duration,
    reconnect_backoff: ReconnectBackoff,
}

impl NodeClientBuilder {
    /// Start a builder for a driver of the given type (e.g. `"knx"`).
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            host: "localhost".into(),
            port: 8080,
            data_dir: ".".into(),
            node_type: node_type.into(),
            name: String::new(),
            version: "0.1.0".into(),
            heartbeat_interval: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(300),
            reconnect_backoff: ReconnectBackoff::default(),
        }
    }

    // ── Hub address ──────────────────────────────────────────────────

    /// Hostname of the hub (default `localhost`).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// The hub's insecure bootstrap port (default 8080). The TLS port
    /// is learned from `server-info`, never configured here.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    // ── Identity / metadata ──────────────────────────────────────────

    /// Directory holding `crt.crt`, `crt.key` and `ca.crt` (default `.`).
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Human-readable display name (defaults to the node type).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Version string announced in `update-node`.
    pub fn version(mut self, v: impl Into<String>) -> Self {
        self.version = v.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Override the keepalive ping interval (default 10s).
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// How long to wait for the hub (or its operator) to approve a
    /// certificate-signing-request (default 5 minutes).
    pub fn bootstrap_timeout(mut self, d: Duration) -> Self {
        self.bootstrap_timeout = d;
        self
    }

    /// Override the reconnect backoff policy.
    pub fn reconnect_backoff(mut self, cfg: ReconnectBackoff) -> Self {
        self.reconnect_backoff = cfg;
        self
    }

    /// Build the [`NodeClient`].
    pub fn build(self) -> Result<NodeClient, NodeSdkError> {
        if self.node_type.is_empty() {
            return Err(NodeSdkError::Config("node_type is required".into()));
        }
        let name = if self.name.is_empty() {
            self.node_type.clone()
        } else {
            self.name
        };

        Ok(NodeClient {
            host: self.host,
            port: self.port,
            data_dir: self.data_dir,
            node_type: self.node_type,
            name,
            version: self.version,
            heartbeat_interval: self.heartbeat_interval,
            bootstrap_timeout: self.bootstrap_timeout,
            reconnect_backoff: self.reconnect_backoff,
            shared: Arc::new(Shared::new()),
        })
    }
}
