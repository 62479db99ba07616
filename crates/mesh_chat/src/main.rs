//! mesh-chat: an interactive chat room on top of a relay node.
//!
//! Lines typed on stdin are flooded to every reachable node; `/whisper`
//! routes a line to one identity. Incoming messages print as
//! `<origin>: <text>`.

mod chat;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_relay::{Endpoint, PeerId, RelayConfig, RelayNode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use chat::{ChatCommand, ENTER, EXIT, HELP, IS_HERE};

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "mesh-chat")]
#[command(about = "Chat over a peer-to-peer relay mesh")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long = "verbose", action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Directory holding keypairs and learned peer keys
    #[arg(short, long)]
    keyring: Option<PathBuf>,

    /// Declared identity [default: <hostname>-<pub port>]
    #[arg(short, long)]
    identity: Option<String>,

    /// Local endpoint to bind
    #[arg(short, long = "local-address", default_value = "*")]
    local_address: String,

    /// Remote endpoint to connect to (repeatable)
    #[arg(short, long = "remote-address")]
    remote_address: Vec<String>,

    /// JSON config file; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load_or_default(path),
            None => RelayConfig::default(),
        };
        config.local_address = self.local_address;
        config.remote_addresses.extend(self.remote_address);
        if let Some(identity) = self.identity {
            config.identity = Some(PeerId::from_string(identity));
        }
        if let Some(keyring) = self.keyring {
            config.keyring_dir = keyring;
        }
        config
    }
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(verbosity > 1)
                .with_thread_ids(false)
                .compact(),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    let config = cli.into_config();
    let remotes = config
        .remote_endpoints()
        .context("Invalid remote address")?;
    let mut node = RelayNode::start_ws(config)
        .await
        .context("Failed to start relay node")?;
    let identity = node.identity().clone();
    info!("Chatting as {identity}");

    for endpoint in &remotes {
        connect(&node, endpoint).await;
    }
    node.publish(ENTER).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        println!("{identity}: EOF");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                };
                match chat::parse_line(&line) {
                    ChatCommand::Say(text) => node.publish(text).await?,
                    ChatCommand::Whisper { target, text } => {
                        node.route_to(&PeerId::from_string(target), text).await?;
                    }
                    ChatCommand::Help => println!("{HELP}"),
                    ChatCommand::Quit => {
                        println!("{identity}: {} (quitting)", line.trim());
                        break;
                    }
                    ChatCommand::Nothing => {}
                }
            }
            messages = node.poll(POLL_TIMEOUT) => {
                let messages = match messages {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("Relay stopped: {e}");
                        break;
                    }
                };
                for msg in messages {
                    println!("{}: {msg}", msg.origin());
                    if msg.text() == ENTER {
                        node.route_to(&PeerId::from(msg.origin()), IS_HERE).await?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("{identity}: ^C break");
                break;
            }
        }
    }

    if let Err(e) = node.publish(EXIT).await {
        warn!("Could not announce exit: {e}");
    }
    node.shutdown().await.context("Relay node stopped with an error")?;
    Ok(())
}

async fn connect(node: &RelayNode, endpoint: &Endpoint) {
    match node.connect(endpoint).await {
        Ok(peer) => info!("Connected to {peer} at {endpoint}"),
        Err(e) => {
            warn!("Could not connect to {endpoint}: {e}");
            eprintln!("could not connect to {endpoint}: {e}");
        }
    }
}
