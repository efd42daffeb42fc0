//! `hearth-hub` — the orchestration server behind the `hearthd` binary.
//!
//! Responsibilities, by module:
//! - [`ca`] — self-issued certificate authority and TLS configs
//! - [`servers`] — insecure + TLS websocket listeners
//! - [`sessions`] — live session registry and broadcast fan-out
//! - [`store`] — devices, nodes, saved states, and their persistence
//! - [`logic`] — edge-triggered rule engine and action runner
//! - [`scheduler`] — cron-fired saved-state replay
//! - [`state`] — the [`state::AppState`] wiring it all together

pub mod ca;
pub mod logic;
pub mod persist;
pub mod scheduler;
pub mod servers;
pub mod sessions;
pub mod state;
pub mod store;
