//! Typed configuration tree.
//!
//! Loading configuration is left to the host. Every struct deserializes
//! with `#[serde(default)]`, so a partial document only overrides the
//! fields it names.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffConfig;
use crate::retry::RetryConfig;

/// Configuration for a thing worker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long a worker waits for a message before passivating itself.
    ///
    /// Default: 2 minutes.
    pub idle_timeout: Duration,

    /// Save a snapshot after this many applied events. `0` disables
    /// snapshots.
    ///
    /// Default: 100.
    pub snapshot_every: u64,

    /// Bounded mailbox size. Requests beyond it are answered with
    /// "unavailable".
    ///
    /// Default: 64.
    pub mailbox_capacity: usize,

    /// Upper bound for loading the snapshot and replaying events.
    ///
    /// Default: 10 seconds.
    pub recovery_timeout: Duration,

    /// Deadline for a persisted command whose headers carry no timeout.
    ///
    /// Default: 10 seconds.
    pub command_timeout: Duration,

    /// Retry policy for appends that fail with a transient error.
    pub append_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            snapshot_every: 100,
            mailbox_capacity: 64,
            recovery_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            append_retry: RetryConfig::default(),
        }
    }
}

/// Configuration for the live channel.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use twinfold::LiveConfig;
///
/// let config = LiveConfig {
///     default_timeout: Duration::from_secs(5),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.min_timeout, Duration::from_secs(1));
/// assert!(config.dispatch_globally);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Timeout for a live signal whose headers carry none.
    ///
    /// Default: 60 seconds.
    pub default_timeout: Duration,

    /// Floor for the effective live timeout.
    ///
    /// Default: 1 second.
    pub min_timeout: Duration,

    /// Whether live responses are correlated through the shared
    /// correlation cache when the headers do not say.
    ///
    /// Default: `true`.
    pub dispatch_globally: bool,

    /// Retry policy for publishing on the pub/sub fabric.
    pub publish_retry: RetryConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            min_timeout: Duration::from_secs(1),
            dispatch_globally: true,
            publish_retry: RetryConfig::default(),
        }
    }
}

/// Configuration for policy enrichment of retrieve-thing responses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Upper bound for the whole policy fetch, retries included. Never
    /// larger than what is left of the parent request's deadline.
    ///
    /// Default: 5 seconds.
    pub timeout: Duration,

    pub retry: RetryConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    pub worker: WorkerConfig,
    pub backoff: BackoffConfig,
    pub live: LiveConfig,
    pub enrichment: EnrichmentConfig,
}
