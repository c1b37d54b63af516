use super::IdentityStore;
use crate::certificate::Identity;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-process store. Useful for agents that keep nothing on disk and for
/// tests that need to fail the persist step.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pair: Mutex<Option<(String, String)>>,
    fail_updates: AtomicBool,
    updates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with a PEM pair. The pair is validated on
    /// first read, not here.
    pub fn with_pair(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            pair: Mutex::new(Some((cert_pem.into(), key_pem.into()))),
            ..Self::default()
        }
    }

    /// Makes subsequent `update` calls fail without touching the stored pair.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Number of successful updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn current(&self) -> Result<Identity> {
        let pair = self.pair.lock().clone();
        match pair {
            Some((cert, key)) => Identity::from_pem(&cert, &key),
            None => Err(Error::NoCertKey("memory store is empty".into())),
        }
    }

    async fn update(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other(
                "memory store configured to fail updates",
            )));
        }

        let identity = Identity::from_pem_bytes(cert_pem, key_pem)?;
        *self.pair.lock() = Some((identity.chain_pem(), identity.private_key_pem().to_string()));
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::self_signed_pair;
    use chrono::{Duration, Utc};

    fn pair(name: &str) -> (String, String) {
        let now = Utc::now();
        self_signed_pair(name, now, now + Duration::hours(1))
    }

    #[tokio::test]
    async fn test_empty_store_reports_no_cert_key() {
        let store = MemoryStore::new();
        assert!(store.current().await.unwrap_err().is_no_cert_key());
    }

    #[tokio::test]
    async fn test_update_then_current() {
        let store = MemoryStore::new();
        let (cert, key) = pair("agent");
        let written = store
            .update(cert.as_bytes(), key.as_bytes())
            .await
            .unwrap();
        let read = store.current().await.unwrap();
        assert_eq!(written, read);
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_pair() {
        let (cert, key) = pair("old");
        let store = MemoryStore::with_pair(cert, key);
        let before = store.current().await.unwrap();

        store.set_fail_updates(true);
        let (new_cert, new_key) = pair("new");
        assert!(store
            .update(new_cert.as_bytes(), new_key.as_bytes())
            .await
            .is_err());
        assert_eq!(store.current().await.unwrap(), before);
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_pair_rejected() {
        let store = MemoryStore::new();
        let (cert, _) = pair("a");
        let (_, other_key) = pair("b");
        assert!(store
            .update(cert.as_bytes(), other_key.as_bytes())
            .await
            .is_err());
        assert!(store.current().await.unwrap_err().is_no_cert_key());
    }
}
