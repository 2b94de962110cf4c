use std::time::Duration;

/// Default number of network attempts per session.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default linear backoff step.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Bounded linear backoff for restarting a failed stream.
///
/// `max_retries` bounds the number of failed attempts a session absorbs: the
/// failure that brings the counter to `max_retries` is terminal, so at most
/// `max_retries` requests are issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Whether a session that has failed `attempt` times may try again.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before the next attempt: `attempt * base`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Like `delay`, with a server `retry:` hint standing in for the base.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.base_delay).saturating_mul(attempt)
    }
}

/// Notification sent to the event sink before a retry is scheduled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryNotice {
    /// Failed attempts so far (1-based).
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    /// Human-readable cause of the failure.
    pub reason: String,
}
