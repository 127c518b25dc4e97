//! designated: the Designate allocation daemon.
//!
//! Loads `designate.toml`, validates the allocation pipeline and serves
//! the REST API. The same configuration drives two offline helpers: one
//! that prints the parsed pipeline and one that runs a single allocation
//! from a JSON file.
//!
//! # Usage
//!
//! ```text
//! designated serve --config /etc/designate.toml --port 8080
//! designated check --config /etc/designate.toml
//! designated allocate --config /etc/designate.toml --input request.json
//! ```

mod offline;
mod serve;
mod startup;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "designated", about = "Designate allocation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the allocation API.
    Serve {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Port to listen on; overrides `[listen] port`.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the configuration and print the allocation pipeline.
    Check {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,
    },

    /// Run one allocation from a JSON request file and print the result.
    Allocate {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,

        /// JSON file holding `{servers, vm, image, package?, tickets?}`.
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,designated=debug,designate=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, port } => serve::run_serve(&config, port).await,
        Command::Check { config } => offline::run_check(&config),
        Command::Allocate { config, input } => offline::run_allocate(&config, &input).await,
    }
}
