use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use dboy_core::{Client, ClientConfig, ClientEvent, ConfigInput};

#[derive(Parser, Debug)]
#[command(name = "dboy", version, about = "dboy point-to-point file delivery")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// JSON config file (defaults to ~/.dboy/config.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Share folder; repeat for several
    #[arg(long = "share", global = true)]
    shares: Vec<String>,

    /// Directory for partial downloads
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the effective configuration
    Info,

    /// Listen for peers and serve shared files
    Listen {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print share links for every shared file
    Share,

    /// Register a download from a share link
    Add {
        link: String,
    },

    /// List downloads and their progress
    List,

    /// Download a linked file from a peer
    Fetch {
        link: String,

        /// Peer address (host:port)
        #[arg(long)]
        peer: String,
    },

    /// Delete a download and its files
    Remove {
        hash: String,
        size: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let mut input = load_input(cli.config.as_deref())?;
    if !cli.shares.is_empty() {
        input.shares = Some(cli.shares.clone());
    }
    if let Some(dir) = &cli.temp_dir {
        input.temp_dir = Some(dir.clone());
    }
    if let Commands::Listen { port: Some(port) } = &cli.cmd {
        input.listen_port = Some(*port);
    }

    let client = Arc::new(Client::new(ClientConfig::resolve(input)));

    match cli.cmd {
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(client.config())?);
        }

        Commands::Listen { .. } => listen(client).await?,

        Commands::Share => {
            let library = client.library().await?;
            for collection in library.collections().await {
                println!("{}:", collection.root().display());
                for item in collection.items().await {
                    match item.url().await {
                        Ok(link) => println!("  {}", link),
                        Err(e) => println!("  {}: {}", item.path().display(), e),
                    }
                }
            }
        }

        Commands::Add { link } => {
            let item = client.downloads().await?.add_by_link(&link).await?;
            println!("✓ Added {} ({} bytes)", item.file_name(), item.size());
            println!("  Data: {}", item.data_path().display());
        }

        Commands::List => {
            let items = client.downloads().await?.items().await?;
            println!("{} download(s):", items.len());
            for item in items {
                println!(
                    "  {} {}/{} bytes  {}",
                    item.file_name(),
                    item.total_bytes_received(),
                    item.size(),
                    item.full_hash()
                );
            }
        }

        Commands::Fetch { link, peer } => {
            let (host, port) = split_peer(&peer)?;
            let item = client.downloads().await?.add_by_link(&link).await?;
            if item.is_complete() {
                println!("✓ Already complete: {}", item.data_path().display());
                return Ok(());
            }

            let mut progress = item.subscribe_progress();
            let size = item.size();
            let reporter = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let got = *progress.borrow_and_update();
                    println!("    Progress: {}/{} bytes", got, size);
                }
            });

            println!("Fetching {} from {}...", item.file_name(), peer);
            let result = client.fetch(&item, host, port).await;
            reporter.abort();
            result.context("Transfer failed")?;
            println!("✓ File received: {}", item.data_path().display());
        }

        Commands::Remove { hash, size } => {
            if client.downloads().await?.remove(&hash, size).await? {
                println!("✓ Removed {}_{}", hash, size);
            } else {
                println!("No download {}_{}", hash, size);
            }
        }
    }

    Ok(())
}

fn load_input(explicit: Option<&Path>) -> Result<ConfigInput> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let default = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dboy")
                .join("config.json");
            if !default.exists() {
                return Ok(ConfigInput::default());
            }
            default
        }
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    Ok(ConfigInput::from_json(&text)?)
}

fn split_peer(peer: &str) -> Result<(&str, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Peer must be host:port, got {}", peer))?;
    let port = port.parse::<u16>().context("Invalid peer port")?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

async fn listen(client: Arc<Client>) -> Result<()> {
    let mut events = client.subscribe();
    client.start().await?;

    let addr = client
        .local_addr()
        .await
        .ok_or_else(|| anyhow::anyhow!("Listener did not come up"))?;
    println!("✓ Listening on {}", addr);
    if let Some(fp) = client.fingerprint().await {
        println!("  Session key: {}", fp);
    }
    for share in &client.config().shares {
        println!("  Sharing: {}", share.display());
    }
    println!("  Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ClientEvent::Connecting(c)) => {
                    println!("\n← Incoming connection from {}", c.peer());
                }
                Some(ClientEvent::Connected(c)) => {
                    let client = client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.serve(c.channel).await {
                            tracing::error!("Serving {} failed: {}", c.peer, e);
                        }
                    });
                }
                Some(ClientEvent::StateChanged(s)) => tracing::debug!("State: {:?}", s),
                None => break,
            }
        }
    }

    client.stop().await?;
    println!("✓ Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dboy_core::ShareLink;

    #[test]
    fn peer_addresses() {
        assert_eq!(split_peer("127.0.0.1:6868").unwrap(), ("127.0.0.1", 6868));
        assert_eq!(split_peer("[::1]:80").unwrap(), ("::1", 80));
        assert!(split_peer("nohost").is_err());
        assert!(split_peer("h:notaport").is_err());
    }

    #[test]
    fn share_links_parse_from_cli_text() {
        let text = format!("dboy://|file|a.txt|1|{}|/", "0".repeat(64));
        assert_eq!(text.parse::<ShareLink>().unwrap().file_name, "a.txt");
    }
}
