//! blobferry command-line entry point.

mod app;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use blobferry_transfer::DigestAlgorithm;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blobferry")]
#[command(about = "Parallel chunked copy of large objects between stores")]
#[command(version)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy one object from the source container to the destination store
    Transfer {
        /// Name of the source object
        object: String,

        /// Destination key [default: the object name]
        #[arg(long)]
        key: Option<String>,

        /// Override number of workers per phase
        #[arg(long)]
        workers: Option<usize>,

        /// Override chunk and part size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Fail unless the destination reports a matching digest
        #[arg(long)]
        strict: bool,

        /// Digest algorithm: md5 or sha256
        #[arg(long)]
        digest: Option<DigestAlgorithm>,

        /// Override source container URL
        #[arg(long)]
        source_url: Option<String>,

        /// Override destination directory
        #[arg(long)]
        dest_dir: Option<PathBuf>,

        /// Print the outcome as JSON to stdout
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only the outcome.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = config::Config::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;

    match cli.command {
        Commands::Transfer {
            object,
            key,
            workers,
            chunk_size,
            strict,
            digest,
            source_url,
            dest_dir,
            json,
        } => {
            if let Some(url) = source_url {
                config.source_url = Some(url);
            }
            if let Some(dir) = dest_dir {
                config.dest_dir = Some(dir);
            }

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                object = %object,
                "starting blobferry"
            );

            let args = app::TransferArgs {
                object,
                key,
                workers,
                chunk_size,
                strict,
                digest,
                json,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(app::run(config, args))
        }
    }
}
