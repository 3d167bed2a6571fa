//! Configuration for the engine and the batch retry policy.

use std::time::Duration;

use serde::Deserialize;

use crate::error::CommError;

/// Backoff and connect-timeout bounds used by the batch coordinator.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Smallest delay before resending a failed request.
    #[serde(with = "millis")]
    pub min_backoff: Duration,

    /// Largest delay before resending a failed request.
    #[serde(with = "millis")]
    pub max_backoff: Duration,

    /// Smallest connect timeout given to a (re)sent request.
    #[serde(with = "millis")]
    pub min_connect_timeout: Duration,

    /// Largest connect timeout given to a (re)sent request.
    #[serde(with = "millis")]
    pub max_connect_timeout: Duration,

    /// How far past the deadline a sent request's due time is parked so it
    /// is never resent unless a failure reschedules it.
    #[serde(with = "millis")]
    pub resend_guard: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            min_connect_timeout: Duration::from_secs(1),
            max_connect_timeout: Duration::from_secs(10),
            resend_guard: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before resending, given the time elapsed since the batch started.
    ///
    /// Doubles the elapsed time, clamped to `[min_backoff, max_backoff]`.
    pub fn backoff(&self, elapsed: Duration) -> Duration {
        elapsed
            .saturating_mul(2)
            .max(self.min_backoff)
            .min(self.max_backoff)
    }

    /// Connect timeout for a send at `elapsed` into the batch with
    /// `remaining` time left before the deadline.
    pub fn connect_timeout(&self, elapsed: Duration, remaining: Duration) -> Duration {
        elapsed
            .max(self.min_connect_timeout)
            .min(self.max_connect_timeout)
            .min(remaining)
    }
}

/// Engine configuration.
///
/// Fields missing from a JSON document take their default values:
///
/// ```
/// use std::time::Duration;
/// use shardcomm::CommConfig;
///
/// let config = CommConfig::from_json(r#"{ "originator_id": "crdn-1", "idle_interval": 20 }"#)
///     .expect("valid config");
/// assert_eq!(config.originator_id, "crdn-1");
/// assert_eq!(config.idle_interval, Duration::from_millis(20));
/// assert_eq!(config.wait_poll_interval, Duration::from_secs(60));
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Id of this node, sent in the correlation header of non-single requests.
    pub originator_id: String,

    /// Log connection problems at `error` instead of `info`.
    pub log_connection_errors: bool,

    /// Soft ceiling of a single blocking wait before re-checking.
    #[serde(with = "millis")]
    pub wait_poll_interval: Duration,

    /// How long the pump blocks in the transport when idle.
    #[serde(with = "millis")]
    pub idle_interval: Duration,

    /// Grace beyond a request's timeout before the engine times it out itself.
    #[serde(with = "millis")]
    pub timeout_slack: Duration,

    /// Pause of the batch loop when nothing of its own is in flight.
    #[serde(with = "millis")]
    pub drop_nap: Duration,

    /// Timeout for delivering an out-of-band answer to the originator.
    #[serde(with = "millis")]
    pub answer_timeout: Duration,

    /// Serve one-entry batches with a synchronous request.
    pub single_request_fast_path: bool,

    /// Batch retry bounds.
    pub retry: RetryPolicy,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            originator_id: String::new(),
            log_connection_errors: false,
            wait_poll_interval: Duration::from_secs(60),
            idle_interval: Duration::from_millis(100),
            timeout_slack: Duration::from_millis(50),
            drop_nap: Duration::from_millis(500),
            answer_timeout: Duration::from_secs(3600),
            single_request_fast_path: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl CommConfig {
    /// Create a default configuration for the node `originator_id`.
    pub fn new(originator_id: impl Into<String>) -> Self {
        Self {
            originator_id: originator_id.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, CommError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Configuration with short intervals for in-process clusters and tests.
    pub fn local() -> Self {
        Self {
            wait_poll_interval: Duration::from_millis(500),
            idle_interval: Duration::from_millis(5),
            timeout_slack: Duration::from_millis(20),
            drop_nap: Duration::from_millis(10),
            answer_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                min_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(200),
                min_connect_timeout: Duration::from_millis(100),
                max_connect_timeout: Duration::from_secs(1),
                resend_guard: Duration::from_secs(1),
            },
            ..Self::default()
        }
    }

    /// Set whether connection problems are logged at `error`.
    pub fn with_log_connection_errors(mut self, enabled: bool) -> Self {
        self.log_connection_errors = enabled;
        self
    }

    /// Enable or disable the one-entry batch fast path.
    pub fn with_single_request_fast_path(mut self, enabled: bool) -> Self {
        self.single_request_fast_path = enabled;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the originator id.
    pub fn with_originator_id(mut self, originator_id: impl Into<String>) -> Self {
        self.originator_id = originator_id.into();
        self
    }
}

/// Durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
