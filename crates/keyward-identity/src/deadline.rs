//! Rotation deadline computation.
//!
//! The deadline is placed at a jittered fraction of the leaf certificate's
//! total lifetime, measured from `not_before`. With the default policy the
//! fraction is drawn uniformly from `[0.7, 0.9)`, so a fleet provisioned at
//! the same moment does not rotate in lockstep.

use crate::clock::{RandomSource, ThreadRandom};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where in the validity window rotation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterPolicy {
    /// Center of the rotation window as a fraction of the lifetime.
    #[serde(default = "default_nominal")]
    pub nominal: f64,
    /// Half-width of the rotation window; zero disables jitter.
    #[serde(default = "default_spread")]
    pub spread: f64,
}

fn default_nominal() -> f64 {
    0.8
}
fn default_spread() -> f64 {
    0.1
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            nominal: default_nominal(),
            spread: default_spread(),
        }
    }
}

impl JitterPolicy {
    /// A policy with no jitter at `fraction` of the lifetime.
    pub fn fixed(fraction: f64) -> Self {
        Self {
            nominal: fraction,
            spread: 0.0,
        }
    }

    /// Lowest fraction this policy can produce.
    pub fn lower(&self) -> f64 {
        self.nominal - self.spread
    }

    /// Highest fraction this policy can produce.
    pub fn upper(&self) -> f64 {
        self.nominal + self.spread
    }

    /// Rejects windows that are not strictly inside the certificate lifetime.
    pub fn validate(&self) -> Result<()> {
        if !self.nominal.is_finite() || !self.spread.is_finite() || self.spread < 0.0 {
            return Err(Error::Config(format!(
                "jitter nominal and spread must be finite and spread non-negative, got {self:?}"
            )));
        }
        if self.lower() <= 0.0 || self.upper() >= 1.0 {
            return Err(Error::Config(format!(
                "rotation window [{}, {}] must lie strictly within (0, 1)",
                self.lower(),
                self.upper()
            )));
        }
        Ok(())
    }

    /// Maps a unit draw onto `[lower, upper)`.
    fn fraction(&self, unit: f64) -> f64 {
        self.lower() + 2.0 * self.spread * unit.clamp(0.0, 1.0)
    }
}

/// Computes jittered rotation deadlines.
#[derive(Clone)]
pub struct DeadlineScheduler {
    policy: JitterPolicy,
    random: Arc<dyn RandomSource>,
}

impl DeadlineScheduler {
    /// Creates a scheduler, validating the policy.
    pub fn new(policy: JitterPolicy, random: Arc<dyn RandomSource>) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy, random })
    }

    /// Returns the policy in use.
    pub fn policy(&self) -> JitterPolicy {
        self.policy
    }

    /// Computes the instant at which rotation should next be attempted.
    ///
    /// A degenerate window (`not_after <= not_before`) yields `not_after`,
    /// which is never later than the window start; callers treat a past
    /// deadline as "rotate now".
    pub fn compute_deadline(
        &self,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let total = not_after - not_before;
        if total <= Duration::zero() {
            return not_after;
        }

        let fraction = self.policy.fraction(self.random.unit());
        let offset_ms = (total.num_milliseconds() as f64 * fraction) as i64;
        not_before + Duration::milliseconds(offset_ms)
    }
}

impl Default for DeadlineScheduler {
    fn default() -> Self {
        Self {
            policy: JitterPolicy::default(),
            random: Arc::new(ThreadRandom),
        }
    }
}

impl std::fmt::Debug for DeadlineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineScheduler")
            .field("policy", &self.policy)
            .finish()
    }
}
