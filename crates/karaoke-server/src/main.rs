//! # karaoke
//!
//! One binary, three roles:
//! - `relay`: the room signaling server every party member connects to
//! - `host`: receives every guest's mic, mixes it, and plays it out loud
//! - `guest`: streams the local microphone to the host

mod guest;
mod host;

use clap::{Parser, Subcommand};
use karaoke_common::config::AppConfig;
use karaoke_relay::{RelayState, build_router};
use std::net::SocketAddr;

#[derive(Parser)]
#[command(name = "karaoke", version, about = "Live microphone relay for karaoke parties")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the room signaling relay.
    Relay {
        #[arg(long, env = "KARAOKE_HOST")]
        host: Option<String>,
        #[arg(long, env = "KARAOKE_PORT")]
        port: Option<u16>,
    },
    /// Receive and mix every guest microphone in a room.
    Host {
        #[arg(long)]
        room: Option<String>,
        /// Relay base URL, e.g. ws://127.0.0.1:1999
        #[arg(long)]
        relay: Option<String>,
    },
    /// Stream this machine's microphone to the room's host.
    Guest {
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        relay: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = karaoke_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "karaoke=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting karaoke v{}", env!("CARGO_PKG_VERSION"));

    match Cli::parse().command {
        Command::Relay { host, port } => run_relay(config, host, port).await,
        Command::Host { room, relay } => {
            let room = resolve_room(config, room)?;
            let relay = relay.unwrap_or_else(|| config.signaling.url.clone());
            host::run(config, &relay, &room).await
        }
        Command::Guest { room, relay } => {
            let room = resolve_room(config, room)?;
            let relay = relay.unwrap_or_else(|| config.signaling.url.clone());
            guest::run(config, &relay, &room).await
        }
    }
}

async fn run_relay(
    config: &AppConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let addr = SocketAddr::new(host.parse()?, port.unwrap_or(config.server.port));

    let router = build_router(RelayState::new(config.signaling.max_room_size));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on ws://{addr}/parties/main/{{room}}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down relay");
        })
        .await?;
    Ok(())
}

fn resolve_room(config: &AppConfig, room: Option<String>) -> anyhow::Result<String> {
    let room = room.unwrap_or_else(|| config.signaling.room.clone());
    karaoke_common::validation::validate_room_id(&room)?;
    Ok(room)
}
