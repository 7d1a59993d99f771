//! Crate-level error types.
//!
//! Failures fall into four groups, and callers treat each one differently:
//!
//! - domain failures ([`ThingError`]) come from strategies, are never
//!   retried, and are forwarded verbatim;
//! - infrastructure failures (append, publish, policy lookups) are retried
//!   with a bounded policy before they surface as [`ExecuteError::Internal`];
//! - availability failures ([`ExecuteError::Unavailable`]) are answered
//!   immediately while a worker is down;
//! - programmer errors crash the worker instead of becoming a domain
//!   outcome.

use std::time::Duration;

use crate::pointer::JsonPointer;
use crate::thing::ThingId;

/// Coarse classification shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NotFound,
    Conflict,
    Unsupported,
    Unavailable,
    Timeout,
    Internal,
}

/// Domain failure produced by a command strategy.
///
/// These are terminal outcomes: no event is written, state and revision
/// are unchanged, and nothing upstream retries them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThingError {
    #[error("thing '{thing_id}' not found")]
    ThingNotFound { thing_id: ThingId },

    #[error("attribute '{pointer}' not found on thing '{thing_id}'")]
    AttributeNotFound {
        thing_id: ThingId,
        pointer: JsonPointer,
    },

    #[error("thing '{thing_id}' has no attributes")]
    AttributesNotFound { thing_id: ThingId },

    #[error("feature '{feature_id}' not found on thing '{thing_id}'")]
    FeatureNotFound {
        thing_id: ThingId,
        feature_id: String,
    },

    #[error("feature '{feature_id}' of thing '{thing_id}' has no properties")]
    FeaturePropertiesNotFound {
        thing_id: ThingId,
        feature_id: String,
    },

    #[error("thing '{thing_id}' has no policy id")]
    PolicyIdNotFound { thing_id: ThingId },

    #[error("thing '{thing_id}' already exists")]
    ThingConflict { thing_id: ThingId },

    #[error("command '{command}' is not supported")]
    UnsupportedCommand { command: String },

    #[error("signal '{signal}' is not supported on this channel")]
    UnsupportedSignal { signal: String },
}

impl ThingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ThingError::ThingNotFound { .. }
            | ThingError::AttributeNotFound { .. }
            | ThingError::AttributesNotFound { .. }
            | ThingError::FeatureNotFound { .. }
            | ThingError::FeaturePropertiesNotFound { .. }
            | ThingError::PolicyIdNotFound { .. } => FailureKind::NotFound,
            ThingError::ThingConflict { .. } => FailureKind::Conflict,
            ThingError::UnsupportedCommand { .. } | ThingError::UnsupportedSignal { .. } => {
                FailureKind::Unsupported
            }
        }
    }
}

/// Error returned to a caller whose request did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Command rejected by a strategy.
    #[error(transparent)]
    Domain(#[from] ThingError),

    /// The target revision was already taken by another writer.
    ///
    /// The worker that saw this is stale and restarts; retrying the
    /// request afterwards is safe.
    #[error("revision conflict on thing '{thing_id}': expected {expected}, log is at {actual}")]
    RevisionConflict {
        thing_id: ThingId,
        expected: u64,
        actual: u64,
    },

    /// No worker is available to serve the request right now.
    #[error("thing '{thing_id}' is unavailable: {reason}")]
    Unavailable { thing_id: ThingId, reason: String },

    /// The request's deadline elapsed before a response arrived.
    #[error("request to thing '{thing_id}' timed out after {timeout:?}")]
    Timeout { thing_id: ThingId, timeout: Duration },

    /// Another in-flight request already owns this correlation id.
    #[error("correlation id '{correlation_id}' is already in use")]
    CorrelationCollision { correlation_id: String },

    /// Infrastructure failure after retries, or a programmer error.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl ExecuteError {
    pub fn unavailable(thing_id: &ThingId, reason: impl Into<String>) -> Self {
        ExecuteError::Unavailable {
            thing_id: thing_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ExecuteError::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `source` as the cause of an internal error.
    pub fn internal_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ExecuteError::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ExecuteError::Domain(e) => e.kind(),
            ExecuteError::RevisionConflict { .. } | ExecuteError::CorrelationCollision { .. } => {
                FailureKind::Conflict
            }
            ExecuteError::Unavailable { .. } => FailureKind::Unavailable,
            ExecuteError::Timeout { .. } => FailureKind::Timeout,
            ExecuteError::Internal { .. } => FailureKind::Internal,
        }
    }

    /// Whether the caller may retry the same request.
    ///
    /// Domain failures are final. Conflicts on revisions, availability and
    /// timeouts are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecuteError::RevisionConflict { .. }
                | ExecuteError::Unavailable { .. }
                | ExecuteError::Timeout { .. }
        )
    }

    /// Whether this error is a domain outcome produced by a strategy.
    pub fn is_domain(&self) -> bool {
        matches!(self, ExecuteError::Domain(_))
    }
}

/// Error returned when reading a worker's state fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The worker is recovering, passivated, or crashed.
    #[error("thing worker is not running")]
    WorkerGone,

    #[error("state read timed out after {0:?}")]
    Timeout(Duration),
}
