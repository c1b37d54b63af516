//! Test doubles for the rotation collaborators.
//!
//! Enabled for this crate's own tests and, for downstream crates, through
//! the `testing` feature.
//!
//! **Warning:** [`LocalAuthority`] signs whatever it is asked to sign. It
//! exists so tests can run the full rotation path in-process.

use crate::clock::{Clock, RandomSource};
use crate::signing::{
    SigningClient, SigningRequest, SigningRequestCondition, SigningRequestWatch, WatchEvent,
    WatchEventType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// A random source that always returns the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(f64);

impl FixedRandom {
    pub fn new(value: f64) -> Self {
        Self(value)
    }
}

impl RandomSource for FixedRandom {
    fn unit(&self) -> f64 {
        self.0
    }
}

fn to_offset(dt: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Certificate(format!("timestamp out of range: {e}")))
}

/// Builds a self-signed P-256 certificate with CN `name` and the exact
/// validity window given. Returns `(cert_pem, key_pem)`.
///
/// # Panics
///
/// Panics if rcgen cannot generate the key or certificate.
pub fn self_signed_pair(
    name: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> (String, String) {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("generate key");
    let mut params = CertificateParams::new(vec![]).expect("certificate params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;
    params.not_before = to_offset(not_before).expect("not_before");
    params.not_after = to_offset(not_after).expect("not_after");
    let cert = params.self_signed(&key).expect("self-sign");
    (cert.pem(), key.serialize_pem())
}

/// How a [`LocalAuthority`] answers new requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Approve and sign immediately.
    AutoApprove,
    /// Deny with the given reason and message.
    Deny { reason: String, message: String },
    /// Never decide; watches stay open until the consumer releases them.
    Pending,
}

/// In-process signing service backed by a self-signed CA.
pub struct LocalAuthority {
    ca_key: KeyPair,
    ca_params: CertificateParams,
    ca_cert_pem: String,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    policy: Mutex<ApprovalPolicy>,
    requests: Mutex<HashMap<String, SigningRequest>>,
    created: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl LocalAuthority {
    /// Creates an authority issuing one-hour certificates that start at the
    /// clock's current time.
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self> {
        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("CA key generation failed: {e}")))?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::Certificate(format!("failed to create params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Keyward Local CA");
        params.distinguished_name = dn;

        let now = clock.now();
        params.not_before = to_offset(now - chrono::Duration::days(1))?;
        params.not_after = to_offset(now + chrono::Duration::days(3650))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| Error::Certificate(format!("CA cert generation failed: {e}")))?;

        Ok(Self {
            ca_key,
            ca_params: params,
            ca_cert_pem: ca_cert.pem(),
            clock,
            ttl: chrono::Duration::hours(1),
            policy: Mutex::new(ApprovalPolicy::AutoApprove),
            requests: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Lifetime of issued certificates.
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn set_policy(&self, policy: ApprovalPolicy) {
        *self.policy.lock() = policy;
    }

    /// PEM of the CA certificate, for trust stores.
    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    /// Number of signing requests created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of watches the consumer has released.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Signs a PEM CSR, returning the leaf followed by the CA certificate.
    pub fn sign(&self, csr_pem: &str) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::SigningRequest(format!("invalid CSR: {e}")))?;

        let now = self.clock.now();
        csr.params.not_before = to_offset(now)?;
        csr.params.not_after = to_offset(now + self.ttl)?;
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let issuer = rcgen::Issuer::from_params(&self.ca_params, &self.ca_key);
        let leaf = csr
            .signed_by(&issuer)
            .map_err(|e| Error::SigningRequest(format!("certificate signing failed: {e}")))?;

        Ok(format!("{}{}", leaf.pem(), self.ca_cert_pem))
    }

    fn decide(&self, request: &mut SigningRequest) -> Result<()> {
        let policy = self.policy.lock().clone();
        match policy {
            ApprovalPolicy::AutoApprove => {
                let csr_pem = String::from_utf8(request.spec.request.clone())
                    .map_err(|e| Error::SigningRequest(format!("CSR is not UTF-8: {e}")))?;
                let chain = self.sign(&csr_pem)?;
                request
                    .status
                    .conditions
                    .push(SigningRequestCondition::approved("AutoApproved", ""));
                request.status.certificate = Some(chain.into_bytes());
            }
            ApprovalPolicy::Deny { reason, message } => {
                request
                    .status
                    .conditions
                    .push(SigningRequestCondition::denied(reason, message));
            }
            ApprovalPolicy::Pending => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAuthority")
            .field("ttl", &self.ttl)
            .field("policy", &*self.policy.lock())
            .finish()
    }
}

#[async_trait]
impl SigningClient for LocalAuthority {
    async fn create(&self, mut request: SigningRequest) -> Result<SigningRequest> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if request.name.is_empty() {
            request.name = format!("{}{n}", request.generate_name);
        }
        request.uid = format!("local-{n}");

        let mut decided = request.clone();
        self.decide(&mut decided)?;
        self.requests.lock().insert(request.name.clone(), decided);
        Ok(request)
    }

    async fn watch(&self, name: &str, _timeout: Duration) -> Result<SigningRequestWatch> {
        let decided = self
            .requests
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SigningRequest(format!("no signing request named {name}")))?;

        let (tx, watch) = SigningRequestWatch::channel(4);
        tokio::spawn(async move {
            let mut added = decided.clone();
            added.status = Default::default();
            if !tx.send(WatchEvent::new(WatchEventType::Added, added)).await {
                return;
            }
            if decided.status.conditions.is_empty() {
                tx.stopped().await;
                return;
            }
            let _ = tx
                .send(WatchEvent::new(WatchEventType::Modified, decided))
                .await;
        });

        let released = self.released.clone();
        Ok(watch.on_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

type Script = dyn Fn(&str) -> Vec<WatchEvent> + Send + Sync;

/// A signing client whose watch streams replay scripted events.
///
/// The script receives the uid assigned to the created request and returns
/// the events to deliver. The stream closes after the last event unless
/// [`hold_open`](Self::hold_open) is set.
pub struct ScriptedSigningClient {
    script: Box<Script>,
    hold_open: bool,
    fail_create: bool,
    created: AtomicUsize,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
    uids: Mutex<HashMap<String, String>>,
    last_request: Mutex<Option<SigningRequest>>,
}

impl ScriptedSigningClient {
    pub fn new(script: impl Fn(&str) -> Vec<WatchEvent> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            hold_open: false,
            fail_create: false,
            created: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            uids: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
        }
    }

    /// Keeps streams open after the scripted events until released.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Makes every `create` call fail.
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// The most recent request passed to `create`.
    pub fn last_request(&self) -> Option<SigningRequest> {
        self.last_request.lock().clone()
    }
}

impl std::fmt::Debug for ScriptedSigningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedSigningClient")
            .field("hold_open", &self.hold_open)
            .field("created", &self.created())
            .field("opened", &self.opened())
            .field("released", &self.released())
            .finish()
    }
}

#[async_trait]
impl SigningClient for ScriptedSigningClient {
    async fn create(&self, mut request: SigningRequest) -> Result<SigningRequest> {
        *self.last_request.lock() = Some(request.clone());
        if self.fail_create {
            return Err(Error::SigningRequest("scripted create failure".into()));
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        request.name = format!("{}{n}", request.generate_name);
        request.uid = format!("scripted-{n}");
        self.uids
            .lock()
            .insert(request.name.clone(), request.uid.clone());
        Ok(request)
    }

    async fn watch(&self, name: &str, _timeout: Duration) -> Result<SigningRequestWatch> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let uid = self.uids.lock().get(name).cloned().unwrap_or_default();
        let events = (self.script)(&uid);
        let hold_open = self.hold_open;

        let (tx, watch) = SigningRequestWatch::channel(events.len() + 1);
        tokio::spawn(async move {
            for event in events {
                if !tx.send(event).await {
                    return;
                }
            }
            if hold_open {
                tx.stopped().await;
            }
        });

        let released = self.released.clone();
        Ok(watch.on_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::Identity;
    use crate::csr::{CsrGenerator, CsrTemplate, StandardCsrGenerator};

    #[test]
    fn test_manual_clock() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_self_signed_pair_exact_window() {
        let nb = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let na = nb + chrono::Duration::seconds(100);
        let (cert, key) = self_signed_pair("exact", nb, na);
        let identity = Identity::from_pem(&cert, &key).unwrap();
        assert_eq!(identity.not_before(), nb);
        assert_eq!(identity.not_after(), na);
    }

    #[test]
    fn test_local_authority_signs_csr_key() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let authority = LocalAuthority::new(Arc::new(ManualClock::new(now)))
            .unwrap()
            .with_ttl(chrono::Duration::minutes(10));
        let generated = StandardCsrGenerator::default()
            .generate(&CsrTemplate::new("agent"))
            .unwrap();

        let chain = authority.sign(generated.csr_pem()).unwrap();
        let identity = Identity::from_pem(&chain, generated.key_pem()).unwrap();
        assert_eq!(identity.chain().len(), 2);
        assert_eq!(identity.not_before(), now);
        assert_eq!(identity.not_after(), now + chrono::Duration::minutes(10));
        assert!(identity.leaf().subject().unwrap().contains("agent"));
    }

    #[tokio::test]
    async fn test_local_authority_rejects_garbage_csr() {
        let authority = LocalAuthority::new(Arc::new(ManualClock::new(Utc::now()))).unwrap();
        let request = SigningRequest::for_csr("csr-", b"garbage".to_vec(), Vec::new());
        assert!(authority.create(request).await.is_err());
    }
}
