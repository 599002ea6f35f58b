//! Configuration for the data synchronizer.

use rand::Rng;
use std::time::Duration;

/// Configuration for a [`DataSynchronizer`](crate::DataSynchronizer).
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Identifies this synchronizer instance; used to name the loop thread.
    pub instance_key: String,
    /// Time between background sync passes.
    pub sync_interval: Duration,
    /// Maximum number of buffered change events drained per namespace per pass.
    pub max_events_per_pass: usize,
    /// Backoff for re-opening change-stream subscriptions that failed.
    pub listen_retry: RetryConfig,
}

impl SynchronizerConfig {
    /// Creates a configuration with default settings.
    pub fn new(instance_key: impl Into<String>) -> Self {
        Self {
            instance_key: instance_key.into(),
            sync_interval: Duration::from_secs(1),
            max_events_per_pass: 1000,
            listen_retry: RetryConfig::default(),
        }
    }

    /// Sets the interval between background passes.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the per-namespace event drain limit.
    pub fn with_max_events_per_pass(mut self, max: usize) -> Self {
        self.max_events_per_pass = max.max(1);
        self
    }

    /// Sets the subscription retry configuration.
    pub fn with_listen_retry(mut self, retry: RetryConfig) -> Self {
        self.listen_retry = retry;
        self
    }
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts; 0 retries forever.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately, without limit.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` failures.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let delay_secs = if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };
        // Out of range for a Duration
        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
