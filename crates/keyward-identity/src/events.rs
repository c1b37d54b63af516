//! Rotation events and counters.
//!
//! Every rotation attempt is reported twice: as a [`RotationEvent`] on a
//! broadcast channel for callers that want to react, and in the
//! [`RotationStats`] counters for callers that only poll.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Step of a rotation attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStage {
    GenerateCsr,
    RequestCertificate,
    Persist,
}

impl RotationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStage::GenerateCsr => "generate_csr",
            RotationStage::RequestCertificate => "request_certificate",
            RotationStage::Persist => "persist",
        }
    }
}

impl std::fmt::Display for RotationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RotationEvent {
    /// A new identity was installed.
    Rotated {
        not_after: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
    /// One rotation attempt failed; the previous identity is still served.
    AttemptFailed { stage: RotationStage, error: String },
    /// Every backoff step of a cycle failed. Retries continue at the
    /// fallback interval.
    BackoffExhausted { attempts: u32 },
}

/// Monotonic counters for a manager.
#[derive(Debug, Default)]
pub struct RotationStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    backoff_exhausted: AtomicU64,
}

impl RotationStats {
    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backoff_exhausted(&self) {
        self.backoff_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Number of backoff cycles that ended without a rotation.
    pub fn backoff_exhausted(&self) -> u64 {
        self.backoff_exhausted.load(Ordering::Relaxed)
    }
}
