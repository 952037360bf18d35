//! Outcome classification: mapping an attempt's result to a retry verdict.

mod http;

pub use http::{AutoClassifier, HttpAware, HttpClassifier, HttpInfo};

use crate::error::AttemptError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Stable reason strings for classified outcomes.
pub mod reason {
    pub const SUCCESS: &str = "success";
    pub const RETRYABLE_ERROR: &str = "retryable_error";
    pub const NON_RETRYABLE_ERROR: &str = "non_retryable_error";
    pub const ABORT: &str = "abort";
    pub const UNKNOWN_OUTCOME: &str = "unknown_outcome";
    pub const CONTEXT_CANCELED: &str = "context_canceled";
    pub const CONTEXT_DEADLINE_EXCEEDED: &str = "context_deadline_exceeded";
    pub const PANIC_IN_CLASSIFIER: &str = "panic_in_classifier";
    pub const HTTP_5XX: &str = "http_5xx";
    pub const HTTP_408: &str = "http_408";
    pub const HTTP_429: &str = "http_429";
    pub const HTTP_NON_IDEMPOTENT: &str = "http_non_idempotent";
    pub const HTTP_TRANSPORT_ERROR: &str = "http_transport_error";
    pub const HTTP_NON_RETRYABLE_STATUS: &str = "http_non_retryable_status";
    pub const CLASSIFIER_TYPE_MISMATCH: &str = "classifier_type_mismatch";
}

/// The classifier's verdict kind. A closed tag set; `Unknown` is demoted to
/// `Abort` at the executor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Retryable,
    NonRetryable,
    Abort,
    Unknown,
}

impl OutcomeKind {
    pub fn default_reason(&self) -> &'static str {
        match self {
            OutcomeKind::Success => reason::SUCCESS,
            OutcomeKind::Retryable => reason::RETRYABLE_ERROR,
            OutcomeKind::NonRetryable => reason::NON_RETRYABLE_ERROR,
            OutcomeKind::Abort => reason::ABORT,
            OutcomeKind::Unknown => reason::UNKNOWN_OUTCOME,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutcomeKind::NonRetryable | OutcomeKind::Abort | OutcomeKind::Unknown)
    }
}

/// A classified attempt result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub reason: String,
    /// Overrides the computed backoff before the next retry slot, e.g. from a
    /// Retry-After hint.
    pub backoff_override: Option<Duration>,
    pub attributes: Vec<(String, String)>,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into(), backoff_override: None, attributes: Vec::new() }
    }

    pub fn success() -> Self {
        Self::new(OutcomeKind::Success, reason::SUCCESS)
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Retryable, reason)
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::NonRetryable, reason)
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Abort, reason)
    }

    pub fn with_backoff_override(mut self, backoff: Duration) -> Self {
        self.backoff_override = Some(backoff);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Boundary normalization applied by the executor to every classifier
    /// result: `Unknown` becomes `Abort`, empty reasons get the kind default.
    pub(crate) fn sanitize(mut self) -> Self {
        if self.kind == OutcomeKind::Unknown {
            self.kind = OutcomeKind::Abort;
            if self.reason.is_empty() {
                self.reason = reason::UNKNOWN_OUTCOME.to_string();
            }
        }
        if self.reason.is_empty() {
            self.reason = self.kind.default_reason().to_string();
        }
        self
    }
}

/// Maps an attempt's result to an [`Outcome`].
///
/// `None` means the attempt succeeded. Implementations must be pure: no I/O,
/// no shared mutable state.
pub trait Classify<E>: Send + Sync {
    fn classify(&self, err: Option<&AttemptError<E>>) -> Outcome;
}

/// Default classifier: every operation error is worth another attempt.
///
/// Context cancellation aborts; a per-attempt deadline is retryable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> Classify<E> for AlwaysRetry {
    fn classify(&self, err: Option<&AttemptError<E>>) -> Outcome {
        match err {
            None => Outcome::success(),
            Some(AttemptError::Canceled) => Outcome::abort(reason::CONTEXT_CANCELED),
            Some(AttemptError::DeadlineExceeded) => {
                Outcome::retryable(reason::CONTEXT_DEADLINE_EXCEEDED)
            }
            Some(_) => Outcome::retryable(reason::RETRYABLE_ERROR),
        }
    }
}

/// Error from [`ClassifierRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("classifier name must not be empty")]
pub struct EmptyClassifierName;

/// Thread-safe `name → classifier` map. Names are whitespace-trimmed.
pub struct ClassifierRegistry<E> {
    inner: RwLock<HashMap<String, Arc<dyn Classify<E>>>>,
}

impl<E> Default for ClassifierRegistry<E> {
    fn default() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }
}

impl<E> ClassifierRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a classifier. Empty names are rejected; re-registration
    /// replaces the previous entry.
    pub fn register(
        &self,
        name: &str,
        classifier: Arc<dyn Classify<E>>,
    ) -> Result<(), EmptyClassifierName> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EmptyClassifierName);
        }
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), classifier);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Classify<E>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name.trim())
            .cloned()
    }
}
