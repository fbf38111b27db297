//! MeshPeer Client
//!
//! Negotiates direct tunnel links with the other members of a mesh,
//! traversing NATs where it can and bridging through peers where it
//! cannot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meshpeer_network::PrivateKey;

mod client;
mod config;
mod daemon;

use client::MeshPeerClient;
use config::ClientConfig;

/// MeshPeer - peer-to-peer mesh tunnel negotiation
#[derive(Parser)]
#[command(name = "meshpeer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.meshpeer/config.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start negotiating with the configured peers
    Start {
        /// Run as daemon
        #[arg(short, long)]
        daemon: bool,

        /// Offer to bridge traffic for other peers
        #[arg(long)]
        bridge: bool,
    },

    /// Stop the daemon
    Stop,

    /// Show current status
    Status,

    /// Generate a new private key
    Keygen {
        /// Force overwrite an existing key
        #[arg(short, long)]
        force: bool,
    },

    /// Probe which NAT traversal techniques work from here
    Probe,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Expand config path
    let config_path = expand_path(&cli.config)?;

    let configured_level = match &cli.log_level {
        Some(level) => level.clone(),
        None => match ClientConfig::load(&config_path).await {
            Ok(config) => config.logging.level,
            Err(_) => "info".to_string(),
        },
    };
    init_logging(&configured_level)?;

    match cli.command {
        Commands::Start { daemon, bridge } => cmd_start(config_path, daemon, bridge).await,
        Commands::Stop => cmd_stop().await,
        Commands::Status => cmd_status().await,
        Commands::Keygen { force } => cmd_keygen(config_path, force).await,
        Commands::Probe => cmd_probe(config_path).await,
        Commands::Config => cmd_config(config_path).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

async fn cmd_start(config_path: PathBuf, daemon: bool, bridge: bool) -> Result<()> {
    info!("Starting MeshPeer...");

    let mut config = ClientConfig::load_or_create(&config_path).await?;
    if bridge {
        config.relay.offers_bridging = true;
    }

    config.validate()?;

    if daemon {
        info!("Running as daemon...");
        daemon::run_daemon(config).await
    } else {
        let client = MeshPeerClient::new(config).await?;
        client.start().await?;

        // Wait for shutdown signal
        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        client.stop().await?;
        Ok(())
    }
}

async fn cmd_stop() -> Result<()> {
    info!("Stopping MeshPeer...");
    daemon::send_stop_signal().await
}

async fn cmd_status() -> Result<()> {
    match daemon::get_status().await {
        Ok(status) => {
            println!("MeshPeer Status");
            println!("===============");
            println!("State: {}", status.state);
            if let Some(error) = &status.last_error {
                println!("Last error: {}", error);
            }
            match (&status.public_endpoint, status.technique) {
                (Some(endpoint), Some(technique)) => println!("Public endpoint: {} ({})", endpoint, technique),
                (Some(endpoint), None) => println!("Public endpoint: {}", endpoint),
                _ => println!("Public endpoint: unknown"),
            }
            println!("Peers: {}/{} connected\n", status.connected_peers(), status.peers.len());

            if !status.peers.is_empty() {
                println!("{:<46} {:<22} {:<14} {:<6}", "Peer", "Status", "Type", "Try");
                println!("{}", "-".repeat(90));
                for peer in &status.peers {
                    println!(
                        "{:<46} {:<22} {:<14} {:<6}",
                        peer.peer,
                        peer.status.to_string(),
                        peer.connection_type
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        peer.try_counter
                    );
                    if let Some(error) = &peer.last_error {
                        println!("  last error: {}", error);
                    }
                }
            }
            Ok(())
        }
        Err(_) => {
            println!("MeshPeer is not running");
            Ok(())
        }
    }
}

async fn cmd_keygen(config_path: PathBuf, force: bool) -> Result<()> {
    let mut config = if config_path.exists() {
        ClientConfig::load(&config_path).await?
    } else {
        ClientConfig::default()
    };

    if !config.identity.private_key.is_empty() && !force {
        anyhow::bail!(
            "A private key is already configured in {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let key = PrivateKey::generate();
    let public_key = key.public_key();
    config.identity.private_key = key.to_base64();
    config.save(&config_path).await?;

    info!("Config saved to {:?}", config_path);

    println!("\nNew key generated.");
    println!("Public key: {}", public_key.to_base64());
    println!("\nShare the public key with your peers, then start with: meshpeer start");

    Ok(())
}

async fn cmd_probe(config_path: PathBuf) -> Result<()> {
    let config = ClientConfig::load_or_create(&config_path).await?;

    println!("Probing NAT traversal techniques...\n");
    let result = client::probe(&config).await?;

    for technique in &result.techniques {
        println!("✓ {}", technique);
    }
    match result.stun_address {
        Some(addr) => println!("\nPublic address seen by STUN: {}", addr),
        None => println!("\nSTUN servers unreachable"),
    }

    Ok(())
}

async fn cmd_config(config_path: PathBuf) -> Result<()> {
    let config = ClientConfig::load(&config_path).await?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

// Helper functions

fn expand_path(path: &PathBuf) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.clone())
    }
}
