// swarmnet - command-line front end for swarmnet-core
//
// Runs a signaling server, or joins a swarm and chats with the peers the
// topology connects us to.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::Path;
use swarmnet_core::testing::{TestProtocolEvent, TestProtocolPlugin};
use swarmnet_core::{
    FullyConnectedTopology, JoinSwarmOptions, MmstConfig, MmstTopology, NetworkManager,
    PeerId, PeerInfo, PeerState, SignalServer, StarTopology, Topic,
};
use tokio::io::AsyncBufReadExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmnet")]
#[command(about = "Swarmnet - peer-to-peer swarm networking", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a websocket signaling server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join a swarm and exchange lines of text with connected peers
    Join {
        /// Topic key (64 hex chars)
        #[arg(short, long)]
        topic: Topic,
        /// Own peer key; random when omitted
        #[arg(short, long)]
        peer: Option<PeerId>,
        #[arg(long, value_enum, default_value = "fully-connected")]
        topology: TopologyKind,
        /// Center peer of a star topology
        #[arg(long, required_if_eq("topology", "star"))]
        center: Option<PeerId>,
        /// Signaling server URL; may repeat. Defaults to the configured servers.
        #[arg(short, long)]
        signal: Vec<String>,
    },
    /// Print a fresh random key, usable as topic or peer id
    Keygen,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyKind {
    FullyConnected,
    Star,
    Mmst,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _guard = init_logging(cli.verbose, config.log_dir.as_deref())?;

    match cli.command {
        Commands::Serve { port } => cmd_serve(&config, port).await,
        Commands::Join {
            topic,
            peer,
            topology,
            center,
            signal,
        } => cmd_join(&config, topic, peer, topology, center, signal).await,
        Commands::Keygen => {
            println!("{}", PeerId::random());
            Ok(())
        }
        Commands::Config { action } => cmd_config(config, action),
    }
}

/// Stderr logging, plus a log file when a log directory is configured
fn init_logging(verbose: u8, log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let file_appender = tracing_appender::rolling::daily(Path::new(dir), "swarmnet.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            builder.with_writer(non_blocking).with_ansi(false).init();
            Ok(Some(guard))
        }
        None => {
            builder.with_writer(std::io::stderr).init();
            Ok(None)
        }
    }
}

async fn cmd_serve(config: &config::Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let server = SignalServer::new();
    let addr = server
        .listen(&format!("0.0.0.0:{}", port))
        .await
        .context("Failed to start signaling server")?;

    println!("{}", "Swarmnet signaling server".bold());
    println!("  {} Listening on ws://{}", "✓".green(), addr);
    println!("  Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    let stats = server.get_stats();
    server.shutdown();
    println!();
    println!("{}", "Shut down".bold());
    println!("  Messages relayed: {}", stats.messages_relayed);
    println!("  Offers relayed:   {}", stats.offers_relayed);
    Ok(())
}

async fn cmd_join(
    config: &config::Config,
    topic: Topic,
    peer: Option<PeerId>,
    topology: TopologyKind,
    center: Option<PeerId>,
    signal: Vec<String>,
) -> Result<()> {
    let peer_id = peer.unwrap_or_else(PeerId::random);
    let manager = NetworkManager::new(config.manager_options(&signal))
        .context("Failed to start network manager")?;
    let plugin = TestProtocolPlugin::new(peer_id);

    let builder = JoinSwarmOptions::builder()
        .topic(topic)
        .peer_id(peer_id)
        .protocol(plugin.provider())
        .label("cli");
    let builder = match topology {
        TopologyKind::FullyConnected => builder.topology(FullyConnectedTopology::new()),
        TopologyKind::Star => {
            let center = center.context("--center is required for a star topology")?;
            builder.topology(StarTopology::new(center))
        }
        TopologyKind::Mmst => builder.topology(MmstTopology::new(MmstConfig::default())),
    };
    let handle = manager
        .join_protocol_swarm(builder.build()?)
        .await
        .context("Failed to join swarm")?;

    println!("{}", "Swarmnet".bold());
    println!("  Topic: {}", topic.to_hex().bright_cyan());
    println!("  Peer:  {}", peer_id.to_hex().bright_yellow());
    if let Some(swarm) = manager.get_swarm(&topic) {
        println!("  Topology: {}", swarm.topology());
    }
    println!();
    println!("Type a line to send it to every connected peer, {} to exit.", "/quit".bright_green());
    println!();

    let mut map = manager
        .subscribe_swarm_map(&topic)
        .context("Swarm vanished after join")?;
    let mut events = plugin.subscribe();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = map.changed() => {
                if changed.is_err() {
                    break;
                }
                let peers = map.borrow_and_update().clone();
                print_map(&peers);
            }
            event = events.recv() => match event {
                Ok(TestProtocolEvent::Connect(peer)) => {
                    println!("{} {} connected", "✓".green(), peer.truncate().bright_cyan());
                }
                Ok(TestProtocolEvent::Disconnect(peer)) => {
                    println!("{} {} disconnected", "✗".red(), peer.truncate().bright_cyan());
                }
                Ok(TestProtocolEvent::Receive { peer, data }) => {
                    println!(
                        "{} {}: {}",
                        "←".bright_blue(),
                        peer.truncate().bright_cyan(),
                        String::from_utf8_lossy(&data)
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} protocol events", n);
                }
                Err(_) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                for peer in plugin.connected() {
                    if let Err(e) = plugin.send(&peer, line.as_bytes().to_vec()) {
                        println!("{} {}: {}", "✗".red(), peer.truncate(), e);
                    }
                }
            }
        }
    }

    handle.leave().await.context("Failed to leave swarm")?;
    manager.destroy().await;
    Ok(())
}

fn print_map(peers: &[PeerInfo]) {
    println!("{} ({} peers)", "Swarm map".bold(), peers.len());
    for peer in peers {
        let state = match peer.state {
            PeerState::Me => "me".bright_yellow(),
            PeerState::Connection(state) => state.to_string().bright_green(),
            PeerState::IndirectlyConnected => "indirect".dimmed(),
        };
        let neighbours: Vec<String> = peer.connections.iter().map(|p| p.truncate()).collect();
        println!(
            "  {} {} [{}]",
            peer.id.truncate().bright_cyan(),
            state,
            neighbours.join(", ")
        );
    }
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<20} {}", key, value.bright_cyan());
            }
            println!();
            println!(
                "  File: {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }
    Ok(())
}
