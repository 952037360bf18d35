//! Error types for resilience execution.

use crate::breaker::CircuitState;
use crate::policy::PolicyKey;
use crate::provider::PolicyError;
use std::fmt;

/// A recovered panic from one of the execution components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicError {
    /// Which component panicked: `operation`, `classifier`, `budget`, `provider`.
    pub component: &'static str,
    pub key: PolicyKey,
    pub message: String,
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic in {} for {}: {}", self.component, self.key, self.message)
    }
}

impl std::error::Error for PanicError {}

/// What a single attempt produced when it did not succeed.
///
/// This is what classifiers see. `Canceled` and `DeadlineExceeded` come from
/// the attempt's context; `Inner` is the operation's own error.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The attempt's context was cancelled.
    Canceled,
    /// The attempt's deadline expired.
    DeadlineExceeded,
    /// The operation returned an error.
    Inner(E),
    /// The operation panicked and recovery is enabled.
    Panicked(PanicError),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("context canceled"),
            Self::DeadlineExceeded => f.write_str("context deadline exceeded"),
            Self::Inner(e) => write!(f, "{e}"),
            Self::Panicked(p) => write!(f, "{p}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AttemptError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Panicked(p) => Some(p),
            _ => None,
        }
    }
}

impl<E> AttemptError<E> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Unified error type returned by the executor.
#[derive(Debug)]
pub enum ExecError<E> {
    /// The caller's context was cancelled.
    Canceled,
    /// The caller's or the call's overall deadline expired.
    DeadlineExceeded,
    /// The circuit breaker short-circuited the call before any attempt.
    CircuitOpen { state: CircuitState, reason: &'static str },
    /// No usable policy for the key.
    NoPolicy { key: PolicyKey, source: PolicyError },
    /// The policy named a classifier that is not registered.
    NoClassifier { name: String },
    /// A component panicked and recovery is enabled.
    Panic(PanicError),
    /// The call failed without an operation error; carries the outcome reason.
    Aborted { reason: String },
    /// The operation's last error.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ExecError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("context canceled"),
            Self::DeadlineExceeded => f.write_str("context deadline exceeded"),
            Self::CircuitOpen { state, reason } => {
                write!(f, "circuit breaker rejected call ({state:?}: {reason})")
            }
            Self::NoPolicy { key, source } => {
                write!(f, "no policy for {key}: {source}")
            }
            Self::NoClassifier { name } => write!(f, "classifier not registered: {name}"),
            Self::Panic(p) => write!(f, "{p}"),
            Self::Aborted { reason } => write!(f, "palisade: {reason}"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ExecError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::NoPolicy { source, .. } => Some(source),
            Self::Panic(p) => Some(p),
            _ => None,
        }
    }
}

impl<E> ExecError<E> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_no_policy(&self) -> bool {
        matches!(self, Self::NoPolicy { .. })
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the operation's error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Extract the operation's error if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// True when the underlying policy lookup hit the not-found sentinel.
    pub fn is_policy_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoPolicy { source: PolicyError::NotFound, .. }
        )
    }
}
