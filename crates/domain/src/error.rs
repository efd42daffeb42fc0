use crate::device::DeviceId;

/// Shared error type used across all hearth crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("saved state not found: {0}")]
    SavedStateNotFound(String),

    #[error("invalid device id {0:?}: expected <node-uuid>.<device-id>")]
    InvalidDeviceId(String),

    #[error("certificate: {0}")]
    Certificate(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
