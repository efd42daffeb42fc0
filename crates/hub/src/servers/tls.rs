//! TLS listener with optional client-certificate authentication.
//!
//! The handshake happens before hyper sees the stream, so the verified
//! peer UUID can be injected as a request extension. A connection
//! without a client certificate still upgrades (gui sessions have no
//! certificate); one with an invalid chain is rejected by rustls during
//! the handshake.

use std::net::SocketAddr;

use anyhow::Context;
use axum::Extension;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::servers::{router, PeerIdentity};
use crate::state::AppState;

pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("tls listener addr")?;
    let acceptor = TlsAcceptor::from(state.ca.server_tls_config()?);
    tracing::info!(%addr, "tls listener started");

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("tls listener stopped");
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
        tokio::spawn(handle_connection(
            state.clone(),
            acceptor.clone(),
            stream,
            remote_addr,
        ));
    }
}

async fn handle_connection(
    state: AppState,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    remote_addr: SocketAddr,
) {
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            tracing::debug!(remote = %remote_addr, error = %e, "tls handshake failed");
            return;
        }
    };

    // First certificate in the presented chain is the leaf. Identity is
    // only granted when the chain verifies against our own root.
    let node_uuid = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|leaf| match state.ca.verify_peer(leaf.as_ref()) {
            Ok(uuid) => Some(uuid),
            Err(e) => {
                tracing::warn!(remote = %remote_addr, error = %e, "client certificate rejected");
                None
            }
        });

    let peer = PeerIdentity {
        node_uuid,
        remote_addr: remote_addr.to_string(),
        secure: true,
    };
    let service = TowerToHyperService::new(router(state).layer(Extension(peer)));
    if let Err(e) = Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls), service)
        .await
    {
        tracing::debug!(remote = %remote_addr, error = %e, "connection ended with error");
    }
}
