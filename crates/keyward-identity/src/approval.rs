//! Submits a CSR and waits for the signing service to decide it.

use crate::signing::{
    ConditionType, KeyUsage, SigningClient, SigningRequest, SigningRequestWatch, WatchEventType,
};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default bound on how long a request may wait for approval.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(3600);

/// Name prefix for created requests.
const GENERATE_NAME: &str = "csr-";

/// Creates signing requests and blocks until they are approved or denied.
#[derive(Clone)]
pub struct ApprovalWaiter {
    client: Arc<dyn SigningClient>,
    timeout: Duration,
}

impl ApprovalWaiter {
    pub fn new(client: Arc<dyn SigningClient>) -> Self {
        Self {
            client,
            timeout: DEFAULT_WATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submits `csr_pem` and returns the PEM-encoded issued certificate.
    ///
    /// Fails with [`Error::Denied`] on an explicit denial,
    /// [`Error::WatchClosed`] if the stream ends undecided, and
    /// [`Error::WatchTimeout`] if no decision arrives in time.
    pub async fn request_certificate(
        &self,
        csr_pem: &[u8],
        usages: &[KeyUsage],
    ) -> Result<Vec<u8>> {
        let request = SigningRequest::for_csr(GENERATE_NAME, csr_pem.to_vec(), usages.to_vec());
        let created = self.client.create(request).await?;
        info!(name = %created.name, uid = %created.uid, "created certificate signing request");

        let mut watch = self.client.watch(&created.name, self.timeout).await?;
        let outcome =
            match tokio::time::timeout(self.timeout, wait_for_decision(&mut watch, &created.uid))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::WatchTimeout(self.timeout)),
            };
        watch.stop();

        if outcome.is_ok() {
            info!(name = %created.name, "certificate signing request approved");
        }
        outcome
    }
}

impl std::fmt::Debug for ApprovalWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalWaiter")
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn wait_for_decision(watch: &mut SigningRequestWatch, uid: &str) -> Result<Vec<u8>> {
    while let Some(event) = watch.next().await {
        if !matches!(
            event.event_type,
            WatchEventType::Added | WatchEventType::Modified
        ) {
            debug!(event_type = ?event.event_type, "ignoring watch event");
            continue;
        }
        if event.object.uid != uid {
            debug!(uid = %event.object.uid, "ignoring event for another request");
            continue;
        }

        let status = &event.object.status;
        for condition in &status.conditions {
            match condition.kind {
                ConditionType::Denied => {
                    return Err(Error::Denied {
                        reason: condition.reason.clone(),
                        message: condition.message.clone(),
                    });
                }
                ConditionType::Approved => {
                    if let Some(cert) = status.certificate.as_ref().filter(|c| !c.is_empty()) {
                        return Ok(cert.clone());
                    }
                    debug!("request approved, waiting for certificate");
                }
            }
        }
    }
    Err(Error::WatchClosed)
}
