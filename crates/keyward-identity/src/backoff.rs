//! Exponential backoff between rotation attempts.
//!
//! `steps` attempts are made in total, so `steps - 1` sleeps separate them.
//! Each sleep is the current base delay plus up to `jitter` of it, and the
//! base is multiplied by `factor` after every sleep. With the defaults that
//! is seven attempts spaced roughly 2, 4, 8, 16, 32 and 64 seconds apart.

use crate::clock::RandomSource;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters for one rotation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the second attempt, before jitter.
    #[serde(rename = "initial_secs", with = "secs_f64")]
    pub initial: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Extra random delay as a fraction of the current delay.
    pub jitter: f64,
    /// Total number of attempts, including the first.
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.1,
            steps: 7,
        }
    }
}

impl Backoff {
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(Error::Config("backoff steps must be at least 1".into()));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff factor must be >= 1.0, got {}",
                self.factor
            )));
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(Error::Config(format!(
                "backoff jitter must be non-negative, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Produces the sleeps between consecutive attempts.
    pub fn schedule(&self, random: &dyn RandomSource) -> Vec<Duration> {
        let sleeps = self.steps.saturating_sub(1) as usize;
        let mut out = Vec::with_capacity(sleeps);
        let mut base = self.initial.as_secs_f64();
        for _ in 0..sleeps {
            let delay = base + random.unit() * self.jitter * base;
            out.push(Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX));
            base *= self.factor;
        }
        out
    }

    /// Upper bound on the total time spent sleeping in one cycle.
    pub fn max_total(&self) -> Duration {
        let mut total = 0.0;
        let mut base = self.initial.as_secs_f64();
        for _ in 1..self.steps {
            total += base * (1.0 + self.jitter);
            base *= self.factor;
        }
        Duration::try_from_secs_f64(total).unwrap_or(Duration::MAX)
    }
}

/// Serializes a `Duration` as fractional seconds.
pub(crate) mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
