//! HTTP/websocket endpoints.
//!
//! The hub listens twice: an insecure port for bootstrap (and the CA
//! download) and a TLS port requiring the client certificate issued
//! during bootstrap. Both serve the same router; the TLS acceptor
//! injects the verified peer UUID as a request extension.

pub mod insecure;
pub mod tls;
mod ws;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use crate::state::AppState;

/// Who is on the other end of a connection, as established at accept
/// time. `node_uuid` is only ever set by the TLS acceptor after chain
/// verification.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub node_uuid: Option<Uuid>,
    pub remote_addr: String,
    pub secure: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/ca.crt", get(ca_cert))
        .with_state(state)
}

/// GET /ca.crt — the CA root, for out-of-band trust pinning.
async fn ca_cert(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-x509-ca-cert")],
        state.ca.ca_cert_pem().to_string(),
    )
}
