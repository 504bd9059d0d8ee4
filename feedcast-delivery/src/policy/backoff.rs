//! Destination backoff.
//!
//! The first failure pauses a destination for `init_failure_timer_ms`; every
//! further consecutive failure multiplies the previous pause by
//! `backoff_multiplier`, capped at `max_failure_timer_ms`. With the defaults
//! this gives 10s, 20s, 40s, ... up to an hour.

use std::time::{Duration, SystemTime};

use rand::Rng;

use crate::snapshot::Timers;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub init_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&Timers::default())
    }
}

impl From<&Timers> for BackoffPolicy {
    fn from(timers: &Timers) -> Self {
        Self {
            init_ms: timers.init_failure_timer_ms,
            max_ms: timers.max_failure_timer_ms,
            multiplier: timers.backoff_multiplier,
            jitter_factor: timers.jitter_factor,
        }
    }
}

impl BackoffPolicy {
    /// Pause after a failure, given the pause that followed the previous
    /// consecutive failure (`0` if this is the first one).
    #[must_use]
    pub fn next_delay_ms(&self, previous_ms: u64) -> u64 {
        if previous_ms == 0 {
            return self.init_ms.min(self.max_ms);
        }

        // Intentional precision loss: delays are far below 2^52 ms
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let grown = ((previous_ms as f64) * self.multiplier).min(self.max_ms as f64) as u64;

        // Never shrink, even with a multiplier of exactly 1.0
        grown.max(previous_ms).min(self.max_ms)
    }

    /// Pause after `failures` consecutive failures.
    #[must_use]
    pub fn delay_for_failures(&self, failures: u32) -> u64 {
        (0..failures).fold(0, |previous, _| self.next_delay_ms(previous))
    }

    /// Randomise `delay_ms` by up to ±`jitter_factor`, never past the ceiling.
    #[must_use]
    pub fn jittered(&self, delay_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || delay_ms == 0 {
            return delay_ms;
        }

        // Intentional precision loss and casting for randomisation
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let range = (delay_ms as f64) * self.jitter_factor;
            let jitter: f64 = rand::rng().random_range(-range..=range);
            ((delay_ms as f64) + jitter).max(0.0) as u64
        };

        jittered.min(self.max_ms)
    }

    /// When a destination that just failed may be tried again.
    #[must_use]
    pub fn resume_at(&self, now: SystemTime, delay_ms: u64) -> SystemTime {
        now + Duration::from_millis(self.jittered(delay_ms))
    }
}
