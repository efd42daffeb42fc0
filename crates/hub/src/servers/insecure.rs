//! Plain-HTTP listener: bootstrap CSR exchange and the CA download.

use std::net::SocketAddr;

use anyhow::Context;
use axum::Extension;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::servers::{router, PeerIdentity};
use crate::state::AppState;

/// Accept loop on a pre-bound listener (tests bind port 0 and pass the
/// listener in). Runs until the token is cancelled.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("insecure listener addr")?;
    tracing::info!(%addr, "insecure listener started");

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("insecure listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        tokio::spawn(handle_connection(state.clone(), stream, remote_addr));
    }
}

async fn handle_connection(state: AppState, stream: tokio::net::TcpStream, remote_addr: SocketAddr) {
    let peer = PeerIdentity {
        node_uuid: None,
        remote_addr: remote_addr.to_string(),
        secure: false,
    };
    let service = TowerToHyperService::new(router(state).layer(Extension(peer)));
    if let Err(e) = Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(remote = %remote_addr, error = %e, "connection ended with error");
    }
}
