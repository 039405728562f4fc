//! Capped exponential backoff shared by the retry loops.

use std::time::Duration;

/// Initial delay for secret fetching.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Delay cap for secret fetching.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Initial delay between SSH dial attempts.
pub const DIAL_MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Delay cap between SSH dial attempts.
pub const DIAL_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Doubling delay sequence, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            delay: min,
            min,
            max,
        }
    }

    /// Delay to wait now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max);
        delay
    }

    /// Delay the next call to `next_delay` would return.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MIN_BACKOFF, MAX_BACKOFF)
    }
}
