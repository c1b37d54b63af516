//! Keyward CLI - inspect and manage a rotating client identity
//!
//! The agent process embeds `keyward-identity` and rotates on its own; this
//! tool works on the same store for operators.
//!
//! # Examples
//!
//! ```bash
//! # Show the stored identity and when it will rotate
//! keyward status
//!
//! # Manual enrollment: write a key and CSR, then import the signed cert
//! keyward generate-csr --out-dir /tmp/enroll
//! keyward import --cert /tmp/enroll/signed.crt --key /tmp/enroll/keyward-client.key
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyward_identity::RotationConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod csr;
mod import;
mod status;

/// Keyward CLI - rotating TLS client identity
#[derive(Parser)]
#[command(name = "keyward")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "KEYWARD_CONFIG")]
    #[arg(default_value = "~/.config/keyward/config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current identity, its validity and rotation deadline
    Status,

    /// Write a fresh private key and CSR for manual enrollment
    GenerateCsr(csr::GenerateCsrArgs),

    /// Validate a signed certificate and key and store them as current
    Import(import::ImportArgs),

    /// Show the effective configuration
    Config,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keyward=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keyward=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!(config_path = %cli.config, "starting keyward");
    let config = RotationConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    match cli.command {
        Commands::Status => status::show(&config).await,
        Commands::GenerateCsr(args) => csr::execute(args, &config).await,
        Commands::Import(args) => import::execute(args, &config).await,
        Commands::Config => config::show(&cli.config, &config),
    }
}
