//! `keyward status`

use anyhow::{Context, Result};
use chrono::Utc;
use keyward_identity::{RotationConfig, RotationManager};
use std::sync::Arc;

pub async fn show(config: &RotationConfig) -> Result<()> {
    let store = config.file_store();
    let current_path = store.current_path();
    let manager = RotationManager::builder(Arc::new(store))
        .from_config(config)
        .build()
        .await
        .context("failed to resolve the current identity")?;

    println!("Keyward Identity Status");
    println!("=======================");
    println!();
    println!("Store: {}", current_path.display());
    println!();

    let Some(identity) = manager.current() else {
        println!("No identity stored and no bootstrap pair configured.");
        println!("Rotation is due immediately once a signing client is available.");
        return Ok(());
    };

    let leaf = identity.leaf();
    let now = Utc::now();
    println!("Subject:     {}", leaf.subject()?);
    println!("Issuer:      {}", leaf.issuer()?);
    println!("Serial:      {}", leaf.serial_hex()?);
    println!("Chain:       {} certificate(s)", identity.chain().len());
    println!("Not before:  {}", identity.not_before());
    println!("Not after:   {}", identity.not_after());
    if identity.is_expired_at(now) {
        println!("             EXPIRED");
    }
    println!();
    println!("Rotation deadline: {}", manager.rotation_deadline());
    println!(
        "Rotation due:      {}",
        if manager.should_rotate() { "yes" } else { "no" }
    );

    Ok(())
}
