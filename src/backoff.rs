//! Delay between retries of a failing listener accept.
//!
//! Accept errors such as `EMFILE` are usually transient: the accept loop
//! sleeps and retries instead of giving up on the listener. Delays double
//! from 5ms up to a 1s cap and reset after the next successful accept.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    const DEFAULT_BASE: Duration = Duration::from_millis(5);
    const DEFAULT_MAX: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }

    pub fn with_limits(base: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            max,
        }
    }

    /// Delay for this retry; the next one will be twice as long.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
