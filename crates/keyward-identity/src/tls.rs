//! rustls client configuration that always presents the current identity.
//!
//! [`RotatingClientCert`] resolves the client certificate per handshake from
//! the [`RotationManager`], so a long-lived `ClientConfig` picks up rotated
//! certificates without being rebuilt.
//!
//! # Example
//!
//! ```ignore
//! use keyward_identity::tls::client_config;
//!
//! let config = client_config(manager.clone(), &ca_bundle_pem)?;
//! let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
//! ```

use crate::manager::RotationManager;
use crate::{Error, Result};
use rustls::client::ResolvesClientCert;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Client certificate resolver backed by a [`RotationManager`].
pub struct RotatingClientCert {
    manager: RotationManager,
}

impl RotatingClientCert {
    pub fn new(manager: RotationManager) -> Self {
        Self { manager }
    }
}

impl std::fmt::Debug for RotatingClientCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingClientCert")
            .field("has_identity", &self.manager.current().is_some())
            .finish()
    }
}

impl ResolvesClientCert for RotatingClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.manager.current().map(|identity| identity.certified_key())
    }

    fn has_certs(&self) -> bool {
        self.manager.current().is_some()
    }
}

/// Builds a client config trusting the PEM roots in `ca_bundle_pem` and
/// presenting the manager's current identity.
pub fn client_config(manager: RotationManager, ca_bundle_pem: &str) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let blocks = pem::parse_many(ca_bundle_pem)
        .map_err(|e| Error::Certificate(format!("failed to parse CA bundle: {e}")))?;
    for block in blocks.into_iter().filter(|b| b.tag() == "CERTIFICATE") {
        roots
            .add(CertificateDer::from(block.into_contents()))
            .map_err(|e| Error::Certificate(format!("failed to add root cert: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Certificate("CA bundle contains no certificates".into()));
    }

    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Certificate(format!("failed to build client config: {e}")))?
        .with_root_certificates(roots)
        .with_client_cert_resolver(Arc::new(RotatingClientCert::new(manager)));

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{LocalAuthority, ManualClock};
    use chrono::{DateTime, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_resolver_tracks_rotation() {
        let clock = Arc::new(ManualClock::new(t0()));
        let authority = Arc::new(LocalAuthority::new(clock.clone()).unwrap());
        let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
            .clock(clock)
            .signing_client(authority)
            .build()
            .await
            .unwrap();
        let resolver = RotatingClientCert::new(manager.clone());

        assert!(!resolver.has_certs());
        assert!(resolver.resolve(&[], &[]).is_none());

        assert!(manager.rotate().await);
        let first = resolver.resolve(&[], &[]).unwrap();
        assert!(resolver.has_certs());

        assert!(manager.rotate().await);
        let second = resolver.resolve(&[], &[]).unwrap();
        assert_ne!(first.cert[0], second.cert[0]);
    }

    #[tokio::test]
    async fn test_client_config_requires_roots() {
        let clock = Arc::new(ManualClock::new(t0()));
        let authority = LocalAuthority::new(clock).unwrap();
        let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap();

        assert!(client_config(manager.clone(), "").is_err());
        let config = client_config(manager, &authority.ca_cert_pem()).unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }
}
