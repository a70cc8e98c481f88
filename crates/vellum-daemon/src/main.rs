//! vellum-daemon: self-hostable record store for vellum projects.
//!
//! Serves live project snapshots and applies mutation batches over
//! WebSocket, persisting each project as JSON on disk.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vellum_daemon::daemon::Daemon;
use vellum_daemon::persistence::ProjectStorage;
use vellum_daemon::server::StoreServer;

#[derive(Parser, Debug)]
#[command(name = "vellum-daemon")]
#[command(about = "Record store daemon for vellum document projects")]
struct Args {
    /// Directory holding persisted project data
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Address to listen on for incoming connections
    #[arg(short, long, default_value = "127.0.0.1:9470")]
    listen: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose).
    let default_filter = if args.verbose {
        "debug,vellum_daemon=debug"
    } else {
        "info,vellum_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting vellum-daemon");
    info!("Data directory: {:?}", args.data_dir);

    let storage = ProjectStorage::new(&args.data_dir);
    let known = storage.list_projects()?;
    info!("Serving {} known project(s)", known.len());

    let listener = StoreServer::bind(&args.listen).await?;
    let daemon = Daemon::new(storage, StoreServer::new());
    daemon.run(listener).await
}
