//! tierfs command line client (tfs).
//!
//! Asks the master where to place or find a file, then talks to the chosen
//! storage node directly.
//!
//! # Usage
//!
//! ```text
//! tfs [OPTIONS] <COMMAND>
//!
//! Commands:
//!   upload    Store a local file
//!   download  Fetch a stored file
//!   stat      Show storage node metrics
//!
//! Options:
//!   -m, --master <ADDR>  Master address [default: 127.0.0.1:7700]
//!   -v, --verbose        Enable debug logging
//! ```

mod common;
mod file;
mod node;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// tierfs command line client.
#[derive(Parser)]
#[command(name = "tfs", version, about = "tierfs command line client")]
struct Cli {
    /// Master address
    #[arg(short = 'm', long, default_value = "127.0.0.1:7700")]
    master: SocketAddr,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a local file
    Upload(file::UploadArgs),
    /// Fetch a stored file
    Download(file::DownloadArgs),
    /// Show storage node metrics
    Stat(node::StatArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Upload(args) => file::upload(cli.master, args).await,
        Commands::Download(args) => file::download(cli.master, args).await,
        Commands::Stat(args) => node::stat(cli.master, args).await,
    }
}
