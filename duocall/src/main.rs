mod console;
mod devices;
mod observer;
mod settings;
mod tracing_helper;

use std::io::{stdout, IsTerminal};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use duocall_lib::{
    call_id::resolve_call_id,
    connection::{signaling::socket::WebSocketSocket, PeerConnection},
    negotiation::{AgentEvent, LocalCommand, NegotiationSession, Phase, RoleStrategy},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    console::{spawn_console, HELP},
    devices::SyntheticDevices,
    observer::ConsoleObserver,
    settings::{Settings, SettingsRepo},
    tracing_helper::init_tracing,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleStrategyArg {
    Check,
    Claim,
}

impl From<RoleStrategyArg> for RoleStrategy {
    fn from(value: RoleStrategyArg) -> Self {
        match value {
            RoleStrategyArg::Check => RoleStrategy::Check,
            RoleStrategyArg::Claim => RoleStrategy::Claim,
        }
    }
}

/// Joins a two-party call, bootstrapping through a relay.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Relay WebSocket endpoint
    #[arg(long, env = "DUOCALL_RELAY")]
    relay: Option<String>,
    /// Call to join; a new one is created when absent or invalid
    #[arg(long)]
    call_id: Option<String>,
    /// Settings file
    #[arg(long, default_value = "duocall.toml")]
    config: String,
    /// STUN/TURN server URL, repeatable
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,
    #[arg(long, value_enum)]
    role_strategy: Option<RoleStrategyArg>,
    /// Fail screen share requests
    #[arg(long)]
    no_screen: bool,
}

impl Args {
    fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(relay) = &self.relay {
            settings.relay_url = relay.clone();
        }
        if !self.ice_servers.is_empty() {
            settings.ice_servers = self.ice_servers.clone();
        }
        if let Some(strategy) = self.role_strategy {
            settings.role_strategy = strategy.into();
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing("./", "duocall.log", stdout().is_terminal())?;

    let settings = args.apply(SettingsRepo::new(args.config.clone()).settings().await);
    let (call_id, generated) = resolve_call_id(args.call_id.as_deref());
    if generated {
        if let Some(input) = &args.call_id {
            warn!("invalid call id {:?}, generated a new one", input);
        }
    }
    println!("Call: {}", call_id);
    println!("Share: {}", call_id.to_query());

    let (tx, rx) = mpsc::unbounded_channel();
    let peer = PeerConnection::new(&settings.ice_servers, tx.clone())
        .await?
        .with_placeholder_samples();
    let relay = WebSocketSocket::connect(&settings.relay_url, tx.clone()).await?;
    info!("relay connected: {}", settings.relay_url);

    let session = NegotiationSession::new(
        call_id,
        peer,
        Box::new(relay),
        settings.role_strategy,
        Box::new(SyntheticDevices::new(!args.no_screen)),
        Box::new(ConsoleObserver),
    );

    println!("{}", HELP);
    let console = spawn_console(tx.clone());
    let ctrl_c = {
        let tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(AgentEvent::Local(LocalCommand::Hangup));
            }
        })
    };
    drop(tx);

    let session = session.run(rx).await;
    console.abort();
    ctrl_c.abort();
    if session.phase() != Phase::Closed {
        warn!("session ended in {:?}", session.phase());
    }
    Ok(())
}
