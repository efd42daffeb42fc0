//! SDK error type shared by the client, identity store, and callbacks.

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum NodeSdkError {
    #[error("config: {0}")]
    Config(String),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("bootstrap: {0}")]
    Bootstrap(String),
    #[error("identity: {0}")]
    Identity(String),
    #[error("not connected")]
    NotConnected,
    #[error("shutdown")]
    Shutdown,
    #[error(transparent)]
    Domain(#[from] hearth_domain::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result alias for callback implementations.
pub type CallbackResult = Result<(), NodeSdkError>;
