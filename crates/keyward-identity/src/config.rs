//! TOML configuration.
//!
//! Every section and field is optional; a missing file yields the defaults.
//!
//! ```toml
//! usages = ["digital signature", "key encipherment", "client auth"]
//! key_algorithm = "ecdsa-p256"
//!
//! [csr]
//! common_name = "system:node:worker-1"
//! organization = ["system:nodes"]
//!
//! [store]
//! dir = "~/.local/state/keyward/pki"
//! prefix = "keyward-client"
//!
//! [bootstrap]
//! cert_file = "/etc/keyward/bootstrap.crt"
//! key_file = "/etc/keyward/bootstrap.key"
//!
//! [rotation]
//! watch_timeout_secs = 3600
//! fallback_interval_secs = 128
//! ```

use crate::backoff::Backoff;
use crate::csr::{CsrTemplate, KeyAlgorithm};
use crate::deadline::JitterPolicy;
use crate::signing::KeyUsage;
use crate::store::FileStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Usages requested for every certificate.
    #[serde(default = "default_usages")]
    pub usages: Vec<KeyUsage>,

    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    /// Subject and SANs of generated CSRs.
    #[serde(default)]
    pub csr: CsrTemplate,

    #[serde(default)]
    pub store: StoreConfig,

    /// Pre-provisioned pair used when the store is empty.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub rotation: RotationTiming,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            usages: default_usages(),
            key_algorithm: KeyAlgorithm::default(),
            csr: CsrTemplate::default(),
            store: StoreConfig::default(),
            bootstrap: BootstrapConfig::default(),
            rotation: RotationTiming::default(),
        }
    }
}

fn default_usages() -> Vec<KeyUsage> {
    KeyUsage::client_defaults()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: String,

    /// File name prefix, as in `<prefix>-current.pem`.
    #[serde(default = "default_store_prefix")]
    pub prefix: String,

    /// Explicit pair read when no current file exists.
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            prefix: default_store_prefix(),
            cert_file: None,
            key_file: None,
        }
    }
}

fn default_store_dir() -> String {
    "/var/lib/keyward/pki".to_string()
}
fn default_store_prefix() -> String {
    "keyward-client".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationTiming {
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,

    /// Retry interval once a backoff cycle is exhausted.
    #[serde(default = "default_fallback_interval_secs")]
    pub fallback_interval_secs: u64,

    #[serde(default)]
    pub jitter: JitterPolicy,

    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RotationTiming {
    fn default() -> Self {
        Self {
            watch_timeout_secs: default_watch_timeout_secs(),
            fallback_interval_secs: default_fallback_interval_secs(),
            jitter: JitterPolicy::default(),
            backoff: Backoff::default(),
        }
    }
}

fn default_watch_timeout_secs() -> u64 {
    3600
}
fn default_fallback_interval_secs() -> u64 {
    128
}

impl RotationConfig {
    /// Loads config from a file path; a missing file gives the defaults.
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let path = Path::new(&expanded);

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RotationConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.rotation.jitter.validate()?;
        self.rotation.backoff.validate()?;
        if self.rotation.watch_timeout_secs == 0 {
            return Err(Error::Config("watch_timeout_secs must be positive".into()));
        }
        if self.rotation.fallback_interval_secs == 0 {
            return Err(Error::Config(
                "fallback_interval_secs must be positive".into(),
            ));
        }
        if self.bootstrap.cert_file.is_some() != self.bootstrap.key_file.is_some() {
            return Err(Error::Config(
                "bootstrap cert_file and key_file must be set together".into(),
            ));
        }
        if self.store.cert_file.is_some() != self.store.key_file.is_some() {
            return Err(Error::Config(
                "store cert_file and key_file must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Builds the configured file store, with `~` expanded.
    pub fn file_store(&self) -> FileStore {
        let store = FileStore::new(expand(&self.store.dir), self.store.prefix.clone());
        match (&self.store.cert_file, &self.store.key_file) {
            (Some(cert), Some(key)) => store.with_key_pair_files(expand(cert), expand(key)),
            _ => store,
        }
    }

    /// Bootstrap cert and key paths, with `~` expanded.
    pub fn bootstrap_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.bootstrap.cert_file, &self.bootstrap.key_file) {
            (Some(cert), Some(key)) => Some((expand(cert), expand(key))),
            _ => None,
        }
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.rotation.watch_timeout_secs)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs(self.rotation.fallback_interval_secs)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
