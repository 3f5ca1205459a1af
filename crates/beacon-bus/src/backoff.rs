use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter for reconnect loops.
///
/// Delay for attempt n is `base * 2^n` capped at `max`, then spread by
/// ±`jitter_factor` so a fleet of instances doesn't reconnect in lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_factor: 0.2,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp_delay = self.base.as_millis() as f64 * 2.0_f64.powi(self.attempt as i32);
        let capped = exp_delay.min(self.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
