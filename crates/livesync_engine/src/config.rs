//! Configuration for the sync client.

use std::time::Duration;

/// Default grace period before an observer-less stream is torn down.
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_millis(50);

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Project (scope) id sent during verification and used in stream keys.
    pub project_id: String,
    /// Field that identifies a document inside list and document streams.
    pub identity_field: String,
    /// How long a stream without observers is kept before teardown.
    pub grace_delay: Duration,
    /// Maximum time to wait for a call response.
    pub call_timeout: Option<Duration>,
    /// Reconnect behavior after a transport drop.
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Creates a new client configuration.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            identity_field: "_id".to_string(),
            grace_delay: DEFAULT_GRACE_DELAY,
            call_timeout: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Sets the document identity field.
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    /// Sets the teardown grace delay.
    pub fn with_grace_delay(mut self, delay: Duration) -> Self {
        self.grace_delay = delay;
        self
    }

    /// Sets the call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Reconnect behavior after the transport drops.
///
/// The default makes a single attempt per drop and reports failure on the
/// diagnostics channel. More attempts back off exponentially.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of connect attempts per drop.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl ReconnectPolicy {
    /// Creates a policy with exponential backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a policy with exactly one attempt per drop.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
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

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before a given attempt (1-indexed).
    ///
    /// The first attempt is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(2) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Cheap pseudo-random value in `[0, 1)` derived from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
