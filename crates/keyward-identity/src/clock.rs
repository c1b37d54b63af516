//! Injectable time and randomness.
//!
//! Deadline computation and backoff jitter go through these traits so tests
//! can pin both the wall clock and the jitter draw.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of uniform random fractions.
pub trait RandomSource: Send + Sync {
    /// Returns a value uniformly drawn from `[0, 1)`.
    fn unit(&self) -> f64;
}

/// Thread-local RNG from the `rand` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}
