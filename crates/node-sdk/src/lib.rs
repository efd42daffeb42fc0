//! `hearth-node-sdk` — Reusable SDK for building Hearth driver nodes.
//!
//! A "node" is one process per protocol integration (KNX, Z-Wave,
//! EnOcean, a cloud API, ...) that connects to the Hearth hub, reports
//! typed device state, and receives state-change commands. This crate
//! provides the building blocks so driver authors never touch the
//! certificate bootstrap, TLS, reconnection, or the wire envelope.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Your driver process                                      │
//! │                                                           │
//! │   let client = NodeClientBuilder::new("knx")              │
//! │       .host("hearth.local")                               │
//! │       .data_dir("/var/lib/hearth-knx")                    │
//! │       .build()?;                                          │
//! │   let node = client.handle();                             │
//! │   node.on_request_state_change(KnxWriter { .. });         │
//! │                                                           │
//! │   let task = client.spawn(CallbackRegistry::new(),        │
//! │                           shutdown.clone());              │
//! │   node.wait_connected().await;                            │
//! │   node.add_or_update(device).await?;                      │
//! │   // ... node.update_state("1", state) as hardware reports│
//! │   task.await;                                             │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow (hard-coded by the SDK)
//!
//! 1. Connect `ws://hub:port/ws` (sub-protocol `node`), read `server-info`
//! 2. No stored identity? Generate a key + CSR (`CommonName` = fresh UUID),
//!    send `certificate-signing-request`, persist the signed certificate
//!    and CA root when they arrive
//! 3. Tear down the insecure session, reconnect `wss://hub:tlsPort/ws`
//!    presenting the client certificate
//! 4. Announce `update-node`, declare `subscribe` topics, sync the local
//!    device list with `update-devices`
//! 5. Main loop: dispatch `setup` / `state-change` to the registered
//!    callbacks, anything else to the [`CallbackRegistry`]
//! 6. On disconnect: reconnect with jittered back-off, restarting at 1
//!
//! A node that can load `crt.crt`/`crt.key`/`ca.crt` from its data
//! directory skips step 2 on every later start.

pub mod builder;
pub mod client;
pub mod identity;
pub mod reconnect;
pub mod registry;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::NodeClientBuilder;
pub use client::{ConfigCallback, NodeClient, NodeHandle, StateChangeCallback};
pub use identity::Identity;
pub use reconnect::{ReconnectBackoff, ReconnectPolicy};
pub use registry::{Callback, CallbackRegistry};
pub use types::{CallbackResult, NodeSdkError};

// Re-export the domain and wire types so drivers never need to import
// the lower crates directly.
pub use hearth_domain::{Device, DeviceId, State};
pub use hearth_protocol::{types as message_types, Message};
