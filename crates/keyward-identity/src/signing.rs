//! Signing-request types and the client seam to the signing service.
//!
//! The shapes here mirror the certificate signing request resource of the
//! signing API closely enough that an adapter only has to move fields. The
//! wire encoding and transport belong to the adapter.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Key usages understood by the signing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    #[serde(rename = "signing")]
    Signing,
    #[serde(rename = "digital signature")]
    DigitalSignature,
    #[serde(rename = "content commitment")]
    ContentCommitment,
    #[serde(rename = "key encipherment")]
    KeyEncipherment,
    #[serde(rename = "key agreement")]
    KeyAgreement,
    #[serde(rename = "data encipherment")]
    DataEncipherment,
    #[serde(rename = "cert sign")]
    CertSign,
    #[serde(rename = "crl sign")]
    CrlSign,
    #[serde(rename = "encipher only")]
    EncipherOnly,
    #[serde(rename = "decipher only")]
    DecipherOnly,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "server auth")]
    ServerAuth,
    #[serde(rename = "client auth")]
    ClientAuth,
    #[serde(rename = "code signing")]
    CodeSigning,
    #[serde(rename = "email protection")]
    EmailProtection,
    #[serde(rename = "s/mime")]
    SMime,
    #[serde(rename = "ipsec end system")]
    IpsecEndSystem,
    #[serde(rename = "ipsec tunnel")]
    IpsecTunnel,
    #[serde(rename = "ipsec user")]
    IpsecUser,
    #[serde(rename = "timestamping")]
    Timestamping,
    #[serde(rename = "ocsp signing")]
    OcspSigning,
    #[serde(rename = "microsoft sgc")]
    MicrosoftSgc,
    #[serde(rename = "netscape sgc")]
    NetscapeSgc,
}

impl KeyUsage {
    /// The usages a TLS client certificate needs.
    pub fn client_defaults() -> Vec<KeyUsage> {
        vec![
            KeyUsage::DigitalSignature,
            KeyUsage::KeyEncipherment,
            KeyUsage::ClientAuth,
        ]
    }

    /// Wire name of this usage.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyUsage::Signing => "signing",
            KeyUsage::DigitalSignature => "digital signature",
            KeyUsage::ContentCommitment => "content commitment",
            KeyUsage::KeyEncipherment => "key encipherment",
            KeyUsage::KeyAgreement => "key agreement",
            KeyUsage::DataEncipherment => "data encipherment",
            KeyUsage::CertSign => "cert sign",
            KeyUsage::CrlSign => "crl sign",
            KeyUsage::EncipherOnly => "encipher only",
            KeyUsage::DecipherOnly => "decipher only",
            KeyUsage::Any => "any",
            KeyUsage::ServerAuth => "server auth",
            KeyUsage::ClientAuth => "client auth",
            KeyUsage::CodeSigning => "code signing",
            KeyUsage::EmailProtection => "email protection",
            KeyUsage::SMime => "s/mime",
            KeyUsage::IpsecEndSystem => "ipsec end system",
            KeyUsage::IpsecTunnel => "ipsec tunnel",
            KeyUsage::IpsecUser => "ipsec user",
            KeyUsage::Timestamping => "timestamping",
            KeyUsage::OcspSigning => "ocsp signing",
            KeyUsage::MicrosoftSgc => "microsoft sgc",
            KeyUsage::NetscapeSgc => "netscape sgc",
        }
    }
}

impl std::fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision recorded on a signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequestCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl SigningRequestCondition {
    pub fn approved(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ConditionType::Approved,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn denied(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ConditionType::Denied,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// What the requester asks for. `username`, `uid` and `groups` are filled
/// in by the signing service from the caller's credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningRequestSpec {
    /// PEM-encoded CSR.
    pub request: Vec<u8>,
    pub usages: Vec<KeyUsage>,
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningRequestStatus {
    pub conditions: Vec<SigningRequestCondition>,
    /// PEM-encoded issued chain, set once approved and signed.
    pub certificate: Option<Vec<u8>>,
}

/// A certificate signing request resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningRequest {
    pub name: String,
    /// Name prefix; the service appends a random suffix when `name` is empty.
    pub generate_name: String,
    /// Assigned by the service on create.
    pub uid: String,
    pub spec: SigningRequestSpec,
    pub status: SigningRequestStatus,
}

impl SigningRequest {
    /// Builds a new request for `csr_pem` with the given usages.
    pub fn for_csr(
        generate_name: impl Into<String>,
        csr_pem: Vec<u8>,
        usages: Vec<KeyUsage>,
    ) -> Self {
        Self {
            generate_name: generate_name.into(),
            spec: SigningRequestSpec {
                request: csr_pem,
                usages,
                ..SigningRequestSpec::default()
            },
            ..Self::default()
        }
    }

    /// First condition of the given kind, if any.
    pub fn condition(&self, kind: ConditionType) -> Option<&SigningRequestCondition> {
        self.status.conditions.iter().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: SigningRequest,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, object: SigningRequest) -> Self {
        Self { event_type, object }
    }
}

/// Receiving half of a signing-request watch.
///
/// The stream is finite: it ends when the producer drops its
/// [`WatchSender`] or when the consumer stops it. Dropping the watch has the
/// same effect as [`stop`](SigningRequestWatch::stop).
pub struct SigningRequestWatch {
    rx: mpsc::Receiver<WatchEvent>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl SigningRequestWatch {
    /// Creates a connected watch pair with room for `buffer` events.
    pub fn channel(buffer: usize) -> (WatchSender, SigningRequestWatch) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            WatchSender { tx },
            SigningRequestWatch {
                rx,
                on_release: None,
            },
        )
    }

    /// Registers a hook run once when the watch is stopped or dropped.
    /// Adapters use it to cancel the underlying server-side watch.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Next event, or `None` once the stream has closed.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Releases the watch. The producer observes this through
    /// [`WatchSender::stopped`].
    pub fn stop(mut self) {
        self.rx.close();
    }
}

impl Drop for SigningRequestWatch {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for SigningRequestWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRequestWatch")
            .field("closed", &self.rx.is_closed())
            .finish()
    }
}

/// Producing half of a signing-request watch, held by client adapters.
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<WatchEvent>,
}

impl WatchSender {
    /// Delivers an event. Returns false once the consumer has stopped.
    pub async fn send(&self, event: WatchEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Resolves once the consumer has stopped or dropped the watch.
    pub async fn stopped(&self) {
        self.tx.closed().await
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Client for the remote signing service.
#[async_trait]
pub trait SigningClient: Send + Sync {
    /// Creates a signing request and returns it as stored by the service,
    /// with `name` and `uid` assigned.
    async fn create(&self, request: SigningRequest) -> Result<SigningRequest>;

    /// Opens a watch on the single request called `name`. The service ends
    /// the stream after `timeout`.
    async fn watch(&self, name: &str, timeout: Duration) -> Result<SigningRequestWatch>;
}
