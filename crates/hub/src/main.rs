use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hearth_hub::servers::{insecure, tls};
use hearth_hub::state::AppState;

#[derive(Parser)]
#[command(name = "hearthd", about = "Home automation hub", version)]
struct Cli {
    /// Working directory for config, CA material and persisted state.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub (the default).
    Serve,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(&cli.data_dir).await
        }
        Some(Command::Version) => {
            println!("hearthd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hearth_hub=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(data_dir: &std::path::Path) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hearthd starting");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let state = AppState::load(data_dir)?;
    tracing::info!(
        uuid = %state.config.uuid,
        name = %state.config.name,
        "hub identity loaded"
    );

    let insecure_addr = format!("{}:{}", state.config.host, state.config.port);
    let insecure_listener = tokio::net::TcpListener::bind(&insecure_addr)
        .await
        .with_context(|| format!("binding to {insecure_addr}"))?;
    let tls_addr = format!("{}:{}", state.config.host, state.config.tls_port);
    let tls_listener = tokio::net::TcpListener::bind(&tls_addr)
        .await
        .with_context(|| format!("binding to {tls_addr}"))?;

    let shutdown = state.shutdown.clone();
    let mut servers = tokio::task::JoinSet::new();
    servers.spawn(insecure::serve(
        state.clone(),
        insecure_listener,
        shutdown.clone(),
    ));
    servers.spawn(tls::serve(state.clone(), tls_listener, shutdown.clone()));
    {
        let scheduler = Arc::clone(&state.scheduler);
        let store = Arc::clone(&state.store);
        let sessions = Arc::clone(&state.sessions);
        let logic = Arc::clone(&state.logic);
        let token = shutdown.clone();
        servers.spawn(async move {
            scheduler.run(store, sessions, logic, token).await;
            Ok(())
        });
    }

    shutdown_signal().await;
    shutdown.cancel();
    state.logic.cancel_all_actions();

    while let Some(result) = servers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "listener exited with error"),
            Err(e) => tracing::warn!(error = %e, "listener task panicked"),
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }
}
