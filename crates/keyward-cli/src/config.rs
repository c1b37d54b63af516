//! `keyward config`

use anyhow::Result;
use keyward_identity::RotationConfig;

/// Show the effective configuration, defaults filled in.
pub fn show(config_path: &str, config: &RotationConfig) -> Result<()> {
    println!("Keyward Configuration");
    println!("=====================");
    println!();
    println!("Config file: {}", config_path);
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}
