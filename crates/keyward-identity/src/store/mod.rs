//! Durable storage for the active identity.
//!
//! The manager reads the store once at startup and writes to it after every
//! successful rotation. A store must persist the new pair before `update`
//! returns; on failure the previously stored pair stays in place.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::certificate::Identity;
use crate::Result;
use async_trait::async_trait;

/// Get/put of a certificate and key pair.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Loads the stored identity.
    ///
    /// Returns [`Error::NoCertKey`](crate::Error::NoCertKey) when nothing has
    /// been stored yet; any other error is treated as fatal at startup.
    async fn current(&self) -> Result<Identity>;

    /// Validates and persists a PEM certificate chain and private key,
    /// returning the parsed identity.
    async fn update(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity>;
}
