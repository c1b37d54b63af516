//! `keyward generate-csr`

use anyhow::{Context, Result};
use clap::Args;
use keyward_identity::{CsrGenerator, RotationConfig, StandardCsrGenerator};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write a fresh private key and CSR for manual enrollment
#[derive(Args, Debug)]
pub struct GenerateCsrArgs {
    /// Directory to write `<name>.key` and `<name>.csr` into
    #[arg(long)]
    pub out_dir: PathBuf,

    /// File name stem; defaults to the store prefix
    #[arg(long)]
    pub name: Option<String>,
}

pub async fn execute(args: GenerateCsrArgs, config: &RotationConfig) -> Result<()> {
    let generated = StandardCsrGenerator::new(config.key_algorithm)
        .generate(&config.csr)
        .context("failed to generate CSR")?;

    let name = args.name.unwrap_or_else(|| config.store.prefix.clone());
    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;

    let key_path = args.out_dir.join(format!("{name}.key"));
    let csr_path = args.out_dir.join(format!("{name}.csr"));
    write_private(&key_path, generated.key_pem())?;
    std::fs::write(&csr_path, generated.csr_pem())
        .with_context(|| format!("failed to write {}", csr_path.display()))?;

    info!(key = %key_path.display(), csr = %csr_path.display(), "wrote key and CSR");
    println!("Private key: {}", key_path.display());
    println!("CSR:         {}", csr_path.display());
    Ok(())
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    // New files are created private; an existing file keeps its mode until
    // the chmod below.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()?;
    Ok(())
}
