//! Rotating TLS client identity for long-lived agents.
//!
//! This crate owns a single certificate/key pair for a process and keeps it
//! valid for the lifetime of that process. Before the certificate expires a
//! new key is generated, a signing request is submitted to a remote authority,
//! and the signed certificate is persisted and swapped in. Readers calling
//! [`RotationManager::current`] keep seeing the previous identity until the
//! swap completes.
//!
//! # Components
//!
//! - [`certificate`] - Parsed identity (chain, leaf validity, private key)
//! - [`csr`] - CSR generation using rcgen (P-256 ECDSA by default)
//! - [`signing`] - Signing-request types and the [`SigningClient`] seam
//! - [`approval`] - Submits a CSR and waits for approval over a watch stream
//! - [`deadline`] - Jittered rotation deadline computation
//! - [`backoff`] - Exponential backoff schedule for retries
//! - [`store`] - [`IdentityStore`] trait with file and in-memory stores
//! - [`manager`] - [`RotationManager`] state machine and background loop
//! - [`events`] - Rotation events and counters
//! - [`config`] - TOML configuration
//! - [`tls`] - rustls client certificate resolver backed by the manager
//!
//! # Example
//!
//! ```
//! use keyward_identity::testing::LocalAuthority;
//! use keyward_identity::{CsrTemplate, MemoryStore, RotationManager, SystemClock};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let authority = Arc::new(LocalAuthority::new(Arc::new(SystemClock))?);
//! let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
//!     .template(CsrTemplate::new("system:node:worker-1"))
//!     .signing_client(authority)
//!     .build()
//!     .await?;
//!
//! assert!(manager.current().is_none());
//! assert!(manager.rotate().await);
//! let identity = manager.current().expect("rotated");
//! assert!(identity.leaf().subject()?.contains("worker-1"));
//! # Ok::<(), keyward_identity::Error>(())
//! # }).unwrap();
//! ```

pub mod approval;
pub mod backoff;
pub mod certificate;
pub mod clock;
pub mod config;
pub mod csr;
pub mod deadline;
pub mod events;
pub mod manager;
pub mod signing;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tls;

pub use approval::ApprovalWaiter;
pub use backoff::Backoff;
pub use certificate::{Certificate, Identity, PrivateKey};
pub use clock::{Clock, RandomSource, SystemClock, ThreadRandom};
pub use config::RotationConfig;
pub use csr::{CsrGenerator, CsrTemplate, GeneratedCsr, KeyAlgorithm, StandardCsrGenerator};
pub use deadline::{DeadlineScheduler, JitterPolicy};
pub use events::{RotationEvent, RotationStage, RotationStats};
pub use manager::{resolve_initial, InitialIdentity, RotationManager, RotationManagerBuilder};
pub use signing::{
    ConditionType, KeyUsage, SigningClient, SigningRequest, SigningRequestCondition,
    SigningRequestWatch, WatchEvent, WatchEventType, WatchSender,
};
pub use store::{FileStore, IdentityStore, MemoryStore};
pub use tls::RotatingClientCert;

use std::time::Duration;

/// Errors that can occur in keyward-identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Certificate or private key could not be parsed or validated.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// CSR generation error.
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// The signing service rejected or failed a create/watch call.
    #[error("signing request failed: {0}")]
    SigningRequest(String),

    /// The signing authority explicitly denied the request.
    #[error("certificate signing request is not approved, reason: {reason}, message: {message}")]
    Denied { reason: String, message: String },

    /// The watch stream ended before the request was approved or denied.
    #[error("watch channel closed")]
    WatchClosed,

    /// No decision arrived within the watch timeout.
    #[error("timed out after {0:?} waiting for the signing request to be decided")]
    WatchTimeout(Duration),

    /// The identity store has no cert/key pair yet.
    #[error("no cert/key available: {0}")]
    NoCertKey(String),

    /// A signing client has already been configured.
    #[error("signing client is already set")]
    SigningClientAlreadySet,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this is the store's "no cert/key yet" miss.
    pub fn is_no_cert_key(&self) -> bool {
        matches!(self, Error::NoCertKey(_))
    }
}

/// Result type for keyward-identity operations.
pub type Result<T> = std::result::Result<T, Error>;
