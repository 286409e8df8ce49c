use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;

use stockline::SyncServer;
use stockline::config;
use stockline_store::MemoryStore;

const DEFAULT_PORT: u16 = 7411;

#[derive(Parser)]
#[command(name = "stockline")]
#[command(about = "Real-time sync service for the Stockline inventory manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.toml (defaults to the current directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server in the foreground
    Serve(ServeArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port to bind (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Serve(args) => run_server(args, data_dir).await,
    }
}

async fn run_server(args: ServeArgs, data_dir: PathBuf) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "stockline=debug,tower_http=debug,info"
    } else {
        "stockline=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Stockline sync service");

    let mut config = config::resolve(&data_dir)?;
    if let Some(host) = args.host {
        config.server.host = Some(host);
    }
    if let Some(port) = args.port {
        config.server.port = Some(port);
    }

    let host = config.server.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = config.server.port.unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;

    // The demo binary runs against the in-memory reference store; the
    // full application wires its CRUD database in here instead.
    let store = Arc::new(MemoryStore::with_sample_data());

    let server = SyncServer::start(addr, store, config).await?;
    info!("ws endpoint ready at ws://{}/sync", server.addr);

    server.serve().await
}
