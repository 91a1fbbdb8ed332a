//! Ferry CLI - Client for the ferry file transfer service
//!
//! Usage:
//!   ferry upload ./photo.jpg              Upload under the file's own name
//!   ferry upload ./a.txt --name b.txt     Upload under another name
//!   ferry download b.txt -o ./copy.txt    Download to a local path
//!   ferry list                            List stored files, newest first

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ferry_grpc::{RemoteFile, TransferClient};

/// Ferry CLI - Upload, download and list files on a ferry server
#[derive(Parser, Debug)]
#[command(name = "ferry")]
struct Args {
    /// Server endpoint
    #[arg(long, default_value = "http://[::1]:50051", global = true)]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        /// File to upload
        path: PathBuf,
        /// Name to store it under (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Download a stored file
    Download {
        /// Stored name
        name: String,
        /// Local destination (defaults to the stored name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List stored files, newest first
    List,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let args = Args::parse();
    let mut client = TransferClient::connect(args.server.clone())
        .await
        .with_context(|| format!("cannot connect to {}", args.server))?;

    match args.command {
        Command::Upload { path, name } => {
            let name = match name {
                Some(name) => name,
                None => default_name(&path)?,
            };
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            let uploaded = client.upload(&name, file).await?;
            println!("uploaded {} ({} bytes)", uploaded.name, uploaded.size);
        }
        Command::Download { name, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            let downloaded = download_to(&mut client, &name, &output).await?;
            println!(
                "downloaded {} ({} bytes) to {}",
                downloaded.name,
                downloaded.size,
                output.display()
            );
        }
        Command::List => {
            for file in client.list().await? {
                println!("{}", format_entry(&file));
            }
        }
    }

    Ok(())
}

fn default_name(path: &Path) -> anyhow::Result<String> {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => Ok(name.to_string()),
        None => bail!("cannot derive a name from {}; pass --name", path.display()),
    }
}

/// Sibling path that receives the bytes until the download is complete.
fn part_path(output: &Path) -> PathBuf {
    let mut part = OsString::from(output.as_os_str());
    part.push(".part");
    PathBuf::from(part)
}

/// Download into `<output>.part` and rename over `output` only on success.
async fn download_to(
    client: &mut TransferClient,
    name: &str,
    output: &Path,
) -> anyhow::Result<RemoteFile> {
    let part = part_path(output);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("cannot create {}", part.display()))?;

    let result = client.download(name, &mut file).await;
    drop(file);
    match result {
        Ok(remote) => {
            tokio::fs::rename(&part, output)
                .await
                .with_context(|| format!("cannot move download to {}", output.display()))?;
            Ok(remote)
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&part).await {
                tracing::warn!(path = %part.display(), error = %rm, "cannot remove partial download");
            }
            Err(e.into())
        }
    }
}

fn format_entry(file: &RemoteFile) -> String {
    let created = file
        .created_at
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or_else(|| "-".to_string(), |d| d.as_secs().to_string());
    format!("{:>12}  {:>10}  {}", file.size, created, file.name)
}
