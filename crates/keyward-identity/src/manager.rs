//! Rotation manager for a single client identity.
//!
//! The `RotationManager` provides:
//! - Lock-protected access to the current identity that never waits on I/O
//! - Startup resolution from the store or a bootstrap pair
//! - A background loop that rotates at a jittered deadline
//! - Exponential backoff, then a fixed retry interval, while rotation fails
//!
//! If rotation keeps failing the manager keeps serving the last identity it
//! has, even past expiry. Failures are visible through [`RotationEvent`]s
//! and [`RotationStats`].
//!
//! # Example
//!
//! ```ignore
//! use keyward_identity::{MemoryStore, RotationManager};
//! use std::sync::Arc;
//!
//! let manager = RotationManager::builder(Arc::new(MemoryStore::new()))
//!     .bootstrap(bootstrap_cert_pem, bootstrap_key_pem)
//!     .signing_client(client)
//!     .build()
//!     .await?;
//!
//! let handle = manager.start().await;
//! let identity = manager.current();
//! ```

use crate::approval::{ApprovalWaiter, DEFAULT_WATCH_TIMEOUT};
use crate::backoff::Backoff;
use crate::certificate::Identity;
use crate::clock::{Clock, RandomSource, SystemClock, ThreadRandom};
use crate::config::RotationConfig;
use crate::csr::{CsrGenerator, CsrTemplate, StandardCsrGenerator};
use crate::deadline::{DeadlineScheduler, JitterPolicy};
use crate::events::{RotationEvent, RotationStage, RotationStats};
use crate::signing::{KeyUsage, SigningClient};
use crate::store::IdentityStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Retry interval once a backoff cycle is exhausted.
pub const DEFAULT_FALLBACK_INTERVAL: Duration = Duration::from_secs(128);

const EVENT_CAPACITY: usize = 32;

/// Identity chosen at startup.
#[derive(Debug, Clone)]
pub struct InitialIdentity {
    pub identity: Option<Arc<Identity>>,
    /// Set when the identity did not come from the store.
    pub force_rotation: bool,
}

/// Picks the startup identity: the stored pair if there is one, else the
/// bootstrap pair, else nothing. Only a store miss falls through; any other
/// store error is returned.
pub async fn resolve_initial(
    store: &dyn IdentityStore,
    bootstrap: Option<(&str, &str)>,
) -> Result<InitialIdentity> {
    match store.current().await {
        Ok(identity) => Ok(InitialIdentity {
            identity: Some(Arc::new(identity)),
            force_rotation: false,
        }),
        Err(e) if e.is_no_cert_key() => {
            let identity = match bootstrap {
                Some((cert, key)) => {
                    debug!("store is empty, using bootstrap identity");
                    Some(Arc::new(Identity::from_pem(cert, key)?))
                }
                None => {
                    debug!("store is empty and no bootstrap identity was given");
                    None
                }
            };
            Ok(InitialIdentity {
                identity,
                force_rotation: true,
            })
        }
        Err(e) => Err(e),
    }
}

struct RotationState {
    current: Option<Arc<Identity>>,
    deadline: DateTime<Utc>,
    force_rotation: bool,
    /// Bumped by every `force_rotation` call.
    force_generation: u64,
}

struct Inner {
    store: Arc<dyn IdentityStore>,
    signing_client: OnceLock<Arc<dyn SigningClient>>,
    csr_generator: Arc<dyn CsrGenerator>,
    template: CsrTemplate,
    usages: Vec<KeyUsage>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    scheduler: DeadlineScheduler,
    backoff: Backoff,
    fallback_interval: Duration,
    watch_timeout: Duration,
    state: RwLock<RotationState>,
    /// Serializes rotation attempts.
    rotation_lock: Mutex<()>,
    started: AtomicBool,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<RotationEvent>,
    stats: RotationStats,
}

/// Owns and rotates one client identity. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RotationManager {
    inner: Arc<Inner>,
}

enum Bootstrap {
    Pem(String, String),
    Files(PathBuf, PathBuf),
}

/// Collects collaborators and tunables for a [`RotationManager`].
pub struct RotationManagerBuilder {
    store: Arc<dyn IdentityStore>,
    template: CsrTemplate,
    usages: Vec<KeyUsage>,
    bootstrap: Option<Bootstrap>,
    signing_client: Option<Arc<dyn SigningClient>>,
    csr_generator: Option<Arc<dyn CsrGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    random: Option<Arc<dyn RandomSource>>,
    jitter: JitterPolicy,
    backoff: Backoff,
    fallback_interval: Duration,
    watch_timeout: Duration,
}

impl RotationManagerBuilder {
    fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            template: CsrTemplate::default(),
            usages: KeyUsage::client_defaults(),
            bootstrap: None,
            signing_client: None,
            csr_generator: None,
            clock: None,
            random: None,
            jitter: JitterPolicy::default(),
            backoff: Backoff::default(),
            fallback_interval: DEFAULT_FALLBACK_INTERVAL,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
        }
    }

    /// Applies every setting from a loaded config except the store, which
    /// the caller has already built.
    pub fn from_config(mut self, config: &RotationConfig) -> Self {
        self.template = config.csr.clone();
        self.usages = config.usages.clone();
        self.csr_generator = Some(Arc::new(StandardCsrGenerator::new(config.key_algorithm)));
        self.jitter = config.rotation.jitter;
        self.backoff = config.rotation.backoff;
        self.fallback_interval = config.fallback_interval();
        self.watch_timeout = config.watch_timeout();
        if let Some((cert, key)) = config.bootstrap_paths() {
            self.bootstrap = Some(Bootstrap::Files(cert, key));
        }
        self
    }

    pub fn template(mut self, template: CsrTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn usages(mut self, usages: Vec<KeyUsage>) -> Self {
        self.usages = usages;
        self
    }

    /// Pair to serve when the store is empty.
    pub fn bootstrap(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.bootstrap = Some(Bootstrap::Pem(cert_pem.into(), key_pem.into()));
        self
    }

    /// Like [`bootstrap`](Self::bootstrap), read from files at build time.
    pub fn bootstrap_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.bootstrap = Some(Bootstrap::Files(cert.into(), key.into()));
        self
    }

    pub fn signing_client(mut self, client: Arc<dyn SigningClient>) -> Self {
        self.signing_client = Some(client);
        self
    }

    pub fn csr_generator(mut self, generator: Arc<dyn CsrGenerator>) -> Self {
        self.csr_generator = Some(generator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn fallback_interval(mut self, interval: Duration) -> Self {
        self.fallback_interval = interval;
        self
    }

    pub fn watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Resolves the initial identity and computes the first deadline.
    ///
    /// Fails on invalid tunables, an undecodable bootstrap pair, or a store
    /// error other than a miss.
    pub async fn build(self) -> Result<RotationManager> {
        let random = self.random.unwrap_or_else(|| Arc::new(ThreadRandom));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let scheduler = DeadlineScheduler::new(self.jitter, random.clone())?;
        self.backoff.validate()?;
        if self.fallback_interval.is_zero() {
            return Err(Error::Config("fallback interval must be positive".into()));
        }

        let bootstrap = match self.bootstrap {
            Some(Bootstrap::Pem(cert, key)) => Some((cert, key)),
            Some(Bootstrap::Files(cert, key)) => Some((
                tokio::fs::read_to_string(&cert).await?,
                tokio::fs::read_to_string(&key).await?,
            )),
            None => None,
        };
        let initial = resolve_initial(
            self.store.as_ref(),
            bootstrap.as_ref().map(|(c, k)| (c.as_str(), k.as_str())),
        )
        .await?;

        let deadline = match &initial.identity {
            Some(identity) => scheduler.compute_deadline(identity.not_before(), identity.not_after()),
            None => clock.now(),
        };
        if let Some(identity) = &initial.identity {
            info!(
                not_after = %identity.not_after(),
                deadline = %deadline,
                force_rotation = initial.force_rotation,
                "resolved initial identity"
            );
        }

        let signing_client = OnceLock::new();
        if let Some(client) = self.signing_client {
            let _ = signing_client.set(client);
        }

        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(RotationManager {
            inner: Arc::new(Inner {
                store: self.store,
                signing_client,
                csr_generator: self
                    .csr_generator
                    .unwrap_or_else(|| Arc::new(StandardCsrGenerator::default())),
                template: self.template,
                usages: self.usages,
                clock,
                random,
                scheduler,
                backoff: self.backoff,
                fallback_interval: self.fallback_interval,
                watch_timeout: self.watch_timeout,
                state: RwLock::new(RotationState {
                    current: initial.identity,
                    deadline,
                    force_rotation: initial.force_rotation,
                    force_generation: 0,
                }),
                rotation_lock: Mutex::new(()),
                started: AtomicBool::new(false),
                wake: Notify::new(),
                shutdown,
                events,
                stats: RotationStats::default(),
            }),
        })
    }
}

impl RotationManager {
    pub fn builder(store: Arc<dyn IdentityStore>) -> RotationManagerBuilder {
        RotationManagerBuilder::new(store)
    }

    /// The identity in use, if any. Never waits for a rotation in progress.
    pub fn current(&self) -> Option<Arc<Identity>> {
        self.inner.state.read().current.clone()
    }

    /// True when there is no identity, rotation was forced, or the deadline
    /// has passed.
    pub fn should_rotate(&self) -> bool {
        let state = self.inner.state.read();
        state.current.is_none()
            || state.force_rotation
            || self.inner.clock.now() >= state.deadline
    }

    pub fn rotation_deadline(&self) -> DateTime<Utc> {
        self.inner.state.read().deadline
    }

    /// Requests a rotation at the next opportunity. A request made while an
    /// attempt is in flight is not satisfied by that attempt.
    pub fn force_rotation(&self) {
        {
            let mut state = self.inner.state.write();
            state.force_rotation = true;
            state.force_generation += 1;
        }
        self.inner.wake.notify_one();
    }

    /// Configures the signing client. Only the first call succeeds.
    pub fn set_signing_client(&self, client: Arc<dyn SigningClient>) -> Result<()> {
        self.inner
            .signing_client
            .set(client)
            .map_err(|_| Error::SigningClientAlreadySet)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> &RotationStats {
        &self.inner.stats
    }

    /// Stops the background loop before its next sleep or attempt. An
    /// attempt already in flight runs to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Starts rotation. Rotates once inline if a rotation is already due,
    /// then spawns the background loop and returns its handle.
    ///
    /// Returns `None` without doing anything when no signing client is
    /// configured or when the manager was already started.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.signing_client.get().is_none() {
            info!("no signing client configured, certificate rotation is disabled");
            return None;
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("certificate rotation already started, ignoring");
            return None;
        }

        if self.should_rotate() {
            info!("certificate rotation is due at startup");
            self.rotate().await;
        }

        let manager = self.clone();
        Some(tokio::spawn(async move { manager.run().await }))
    }

    /// Makes one rotation attempt. Returns whether a new identity was
    /// installed. Concurrent callers are serialized.
    pub async fn rotate(&self) -> bool {
        let _guard = self.inner.rotation_lock.lock().await;
        self.inner.stats.record_attempt();
        let generation = self.inner.state.read().force_generation;

        match self.try_rotate().await {
            Ok(identity) => {
                self.install(identity, generation);
                true
            }
            Err((stage, e)) => {
                self.inner.stats.record_failure();
                warn!(stage = %stage, error = %e, "certificate rotation failed");
                if let Some(current) = self.current() {
                    if current.is_expired_at(self.inner.clock.now()) {
                        warn!(
                            not_after = %current.not_after(),
                            "serving an expired certificate until rotation succeeds"
                        );
                    }
                }
                let _ = self.inner.events.send(RotationEvent::AttemptFailed {
                    stage,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    async fn try_rotate(&self) -> std::result::Result<Identity, (RotationStage, Error)> {
        let client = self.inner.signing_client.get().cloned().ok_or_else(|| {
            (
                RotationStage::RequestCertificate,
                Error::SigningRequest("no signing client configured".into()),
            )
        })?;

        let generated = self
            .inner
            .csr_generator
            .generate(&self.inner.template)
            .map_err(|e| (RotationStage::GenerateCsr, e))?;

        let cert_pem = ApprovalWaiter::new(client)
            .with_timeout(self.inner.watch_timeout)
            .request_certificate(generated.csr_pem().as_bytes(), &self.inner.usages)
            .await
            .map_err(|e| (RotationStage::RequestCertificate, e))?;

        self.inner
            .store
            .update(&cert_pem, generated.key_pem().as_bytes())
            .await
            .map_err(|e| (RotationStage::Persist, e))
    }

    /// Swaps in `identity`. The force flag is cleared only if no
    /// `force_rotation` call arrived since `generation` was read.
    fn install(&self, identity: Identity, generation: u64) {
        let identity = Arc::new(identity);
        let deadline = self
            .inner
            .scheduler
            .compute_deadline(identity.not_before(), identity.not_after());
        {
            let mut state = self.inner.state.write();
            state.current = Some(identity.clone());
            state.deadline = deadline;
            if state.force_generation == generation {
                state.force_rotation = false;
            }
        }

        self.inner.stats.record_success();
        info!(
            not_after = %identity.not_after(),
            deadline = %deadline,
            "rotated client certificate"
        );
        let _ = self.inner.events.send(RotationEvent::Rotated {
            not_after: identity.not_after(),
            deadline,
        });
    }

    async fn run(self) {
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        loop {
            if !self.sleep_until_due(&mut shutdown_rx).await {
                break;
            }
            if !self.rotate_with_backoff(&mut shutdown_rx).await {
                break;
            }
        }
        info!("certificate rotation loop stopped");
    }

    /// Waits until rotation is due. Returns false on shutdown.
    async fn sleep_until_due(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown_rx.borrow() {
                return false;
            }
            if self.should_rotate() {
                return true;
            }

            let remaining = (self.rotation_deadline() - self.inner.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(wait = ?remaining, "waiting for rotation deadline");

            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.inner.wake.notified() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Runs one backoff cycle and, if it is exhausted, the fallback loop.
    /// Returns false on shutdown.
    async fn rotate_with_backoff(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let schedule = self.inner.backoff.schedule(self.inner.random.as_ref());
        let attempts = schedule.len() as u32 + 1;

        for step in 0..attempts as usize {
            if !self.should_rotate() || self.rotate().await {
                return true;
            }
            if let Some(delay) = schedule.get(step) {
                if !pause(*delay, shutdown_rx).await {
                    return false;
                }
            }
        }

        self.inner.stats.record_backoff_exhausted();
        let _ = self
            .inner
            .events
            .send(RotationEvent::BackoffExhausted { attempts });
        error!(
            attempts,
            retry_interval = ?self.inner.fallback_interval,
            "reached backoff limit, still unable to rotate certs"
        );

        loop {
            if !pause(self.inner.fallback_interval, shutdown_rx).await {
                return false;
            }
            if !self.should_rotate() || self.rotate().await {
                return true;
            }
        }
    }
}

/// Sleeps for `delay` unless shutdown is signalled first.
async fn pause(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
    }
}

impl std::fmt::Debug for RotationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("RotationManager")
            .field("has_identity", &state.current.is_some())
            .field("deadline", &state.deadline)
            .field("force_rotation", &state.force_rotation)
            .field("signing_client", &self.inner.signing_client.get().is_some())
            .finish()
    }
}
