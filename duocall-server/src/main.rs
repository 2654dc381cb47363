mod tracing_helper;

use std::{io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use duocall_lib::signaling_server::relay::Relay;
use duocall_server::{config::Config, routes::router, sweeper::spawn_sweeper};
use tokio::{net::TcpListener, signal};
use tracing::info;

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    if std::io::stdout().is_terminal() {
        tracing_helper::init_local_tracing()?;
    } else {
        tracing_helper::init_server_tracing()?;
    }

    let relay = Arc::new(Relay::new());
    let sweeper = spawn_sweeper(relay.clone(), config.call_ttl(), config.sweep_interval());

    let listener = TcpListener::bind((config.host, config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!(
        "{} {} listening on {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    Ok(())
}
