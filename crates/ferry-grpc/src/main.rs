//! Ferry gRPC Server
//!
//! Serves streamed uploads, downloads and listings out of a local storage
//! directory.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ferry_grpc::{FerryServer, ServerConfig};

/// Ferry gRPC Server - Streamed file transfer with load shedding
#[derive(Parser, Debug)]
#[command(name = "ferry-server")]
#[command(about = "gRPC server for streamed file uploads and downloads")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Directory holding stored files
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Maximum concurrent uploads plus downloads
    #[arg(long)]
    transfer_limit: Option<usize>,

    /// Maximum concurrent listings
    #[arg(long)]
    listing_limit: Option<usize>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(storage) = self.storage {
            config.storage_root = storage;
        }
        if let Some(limit) = self.transfer_limit {
            config.limits.transfer = limit;
        }
        if let Some(limit) = self.listing_limit {
            config.limits.listing = limit;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Args::parse().into_config()?;

    let server = FerryServer::new(config);
    server.run().await?;

    Ok(())
}
