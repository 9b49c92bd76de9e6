//! Reconnect delay sequence.
//!
//! The first reconnect waits the policy's base delay; each further failed
//! attempt multiplies the delay up to the cap. A successful open resets the
//! sequence. Delays are never below [`super::MIN_RECONNECT_DELAY`].

use std::time::Duration;

use super::ReconnectPolicy;

/// Stateful delay calculator for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh sequence for `policy`.
    #[must_use]
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let base = policy.effective_base_delay();
        Self {
            base,
            cap: policy.effective_max_delay(),
            multiplier: if policy.multiplier.is_finite() {
                policy.multiplier.max(1.0)
            } else {
                1.0
            },
            max_attempts: policy.max_attempts,
            next: base,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        let delay = self.next;
        self.attempts += 1;
        if self.multiplier > 1.0 {
            let grown = self.next.as_secs_f64() * self.multiplier;
            self.next = Duration::try_from_secs_f64(grown)
                .map_or(self.cap, |delay| delay.clamp(self.base, self.cap));
        }
        Some(delay)
    }

    /// Back to the base delay; called after every successful open.
    pub fn reset(&mut self) {
        self.next = self.base;
        self.attempts = 0;
    }

    /// Attempts handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
