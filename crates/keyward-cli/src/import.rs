//! `keyward import`

use anyhow::{Context, Result};
use clap::Args;
use keyward_identity::{IdentityStore, RotationConfig};
use std::path::PathBuf;

/// Validate a signed certificate and key and store them as current
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// PEM certificate chain, leaf first
    #[arg(long)]
    pub cert: PathBuf,

    /// PEM private key matching the leaf
    #[arg(long)]
    pub key: PathBuf,
}

pub async fn execute(args: ImportArgs, config: &RotationConfig) -> Result<()> {
    let cert = tokio::fs::read(&args.cert)
        .await
        .with_context(|| format!("failed to read {}", args.cert.display()))?;
    let key = tokio::fs::read(&args.key)
        .await
        .with_context(|| format!("failed to read {}", args.key.display()))?;

    let store = config.file_store();
    let identity = store
        .update(&cert, &key)
        .await
        .context("failed to import certificate and key")?;

    println!("Imported {}", identity.leaf().subject()?);
    println!("Valid until {}", identity.not_after());
    println!("Stored at {}", store.current_path().display());
    Ok(())
}
