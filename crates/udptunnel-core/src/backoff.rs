//! Reconnect delay state machine shared by every connector that dials or binds.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Floor for the reconnect delay.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default cap for the reconnect delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of retries (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: MIN_RETRY_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Build a policy from the `max-retries` setting, where any negative
    /// value means "retry forever".
    pub fn from_max_retries(max_retries: i64, max_delay: Duration) -> Self {
        Self {
            min_delay: MIN_RETRY_DELAY,
            max_delay,
            max_attempts: u32::try_from(max_retries).ok(),
        }
    }

    fn initial_delay(&self) -> Duration {
        self.min_delay.min(self.max_delay)
    }
}

/// Result of [`Backoff::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The delay elapsed; try again.
    Retry,
    /// The shutdown token fired during the wait.
    Cancelled,
    /// The retry budget is spent. Terminal for the owning connector.
    Exhausted,
}

/// Per-connector backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            delay: policy.initial_delay(),
        }
    }

    /// Forget previous failures. Called after every successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.policy.initial_delay();
    }

    /// Number of failed attempts since the last reset.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next [`wait`](Self::wait) will sleep for.
    pub const fn current_delay(&self) -> Duration {
        self.delay
    }

    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Record a failed attempt and sleep before the next one.
    ///
    /// The delay doubles after every completed wait, capped at
    /// `policy.max_delay`.
    pub async fn wait(&mut self, tag: &str, cancel: &CancellationToken) -> WaitOutcome {
        self.attempt = self.attempt.saturating_add(1);

        if let Some(max) = self.policy.max_attempts
            && self.attempt > max
        {
            error!(connector = %tag, attempts = self.attempt - 1, "Retry limit reached");
            return WaitOutcome::Exhausted;
        }

        warn!(
            connector = %tag,
            attempt = self.attempt,
            delay_ms = self.delay.as_millis(),
            "Retrying"
        );

        tokio::select! {
            () = sleep(self.delay) => {}
            () = cancel.cancelled() => return WaitOutcome::Cancelled,
        }

        self.delay = self.delay.saturating_mul(2).min(self.policy.max_delay);
        WaitOutcome::Retry
    }
}
