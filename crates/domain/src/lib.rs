//! `hearth-domain` — core data model shared by the hub, the wire protocol
//! and the node SDK.
//!
//! Everything in here is plain data: no I/O, no locking, no channels.
//! Concurrency policy (who holds the `RwLock`, when broadcasts fire) is
//! the hub's business; persistence formats are defined by the types'
//! serde impls so `rules.json`/`savedstate.json` round-trip exactly.

pub mod config;
pub mod device;
pub mod error;
pub mod node;
pub mod savedstate;
pub mod state;

pub use config::HubConfig;
pub use device::{Device, DeviceId, DeviceList};
pub use error::{Error, Result};
pub use node::{Connection, Node};
pub use savedstate::{SavedState, SavedStateStore};
pub use state::{value_eq, State};
