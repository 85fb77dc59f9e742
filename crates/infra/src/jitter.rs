//! Randomized pre-execution delay.
//!
//! Spreads platform calls so bursts of changes do not look machine-generated.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use safeexec_core::ChangeRequest;

#[derive(Debug)]
pub struct JitterScheduler {
    rng: Mutex<StdRng>,
}

impl Default for JitterScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterScheduler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic sequence for tests and simulations.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform delay in `[jitter_min_ms, jitter_max_ms]`, bounds inclusive.
    pub fn delay(&self, request: &ChangeRequest) -> Duration {
        self.delay_between(request.jitter_min_ms, request.jitter_max_ms)
    }

    pub fn delay_between(&self, min_ms: u64, max_ms: u64) -> Duration {
        let (lo, hi) = if min_ms <= max_ms { (min_ms, max_ms) } else { (max_ms, min_ms) };
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Duration::from_millis(rng.random_range(lo..=hi))
    }
}
