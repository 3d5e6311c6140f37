//! SRPL Node -- single binary SRP replication node.
//!
//! Usage:
//!   srpl-node                          # Run with default config
//!   srpl-node --config path.toml       # Run with custom config
//!   srpl-node show-config              # Print the effective config
//!   srpl-node decode-txt <hex>         # Decode a partner TXT record

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use srpl_node::config::NodeConfig;
use srpl_node::{expand_tilde, spawn_node};
use srpl_protocol::txt::entries;
use srpl_protocol::PartnerTxt;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "srpl-node", about = "SRP replication node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.srpl/config.toml")]
    config: String,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Decode a partner advertisement TXT record
    DecodeTxt {
        /// TXT record bytes, hex encoded
        hex: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "srpl=info".into());
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::ShowConfig) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
        Some(Commands::DecodeTxt { hex }) => decode_txt(&hex),
        Some(Commands::Run) | None => run_node(cfg).await,
    }
}

fn decode_txt(hex_str: &str) -> anyhow::Result<()> {
    let txt = hex::decode(hex_str.trim()).context("TXT record is not valid hex")?;
    for entry in entries(&txt) {
        let entry = entry?;
        match entry.value {
            Some(value) => println!("{}={}", entry.key, String::from_utf8_lossy(value)),
            None => println!("{}", entry.key),
        }
    }
    match PartnerTxt::parse(&txt) {
        Ok(partner) => {
            println!("domain:      {}", partner.domain);
            println!("allows join: {}", partner.allows_join);
            println!("peer id:     {}", partner.peer_id);
            println!("dataset id:  {}", partner.dataset_id);
        }
        Err(e) => println!("not a usable partner advert: {e}"),
    }
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let node = spawn_node(cfg).await?;
    tracing::info!(listen_addr = %node.listen_addr(), "srpl: node running, press Ctrl-C to stop");

    let mut status_tick = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_tick.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = status_tick.tick() => {
                let status = node.status().await?;
                tracing::info!(
                    state = %status.state,
                    peer_id = %status.peer_id,
                    dataset_id = ?status.dataset_id.map(|d| d.to_string()),
                    domain = ?status.domain,
                    partners = status.partners.len(),
                    hosts = status.hosts.len(),
                    "srpl: status"
                );
                for partner in &status.partners {
                    tracing::debug!(
                        peer = %partner.sock_addr,
                        peer_id = %partner.peer_id,
                        role = ?partner.role,
                        state = %partner.session_state,
                        queued = partner.queued,
                        "srpl: partner"
                    );
                }
            }
        }
    }

    tracing::info!("srpl: shutting down...");
    node.shutdown().await;
    tracing::info!("srpl: shutdown complete");
    Ok(())
}
