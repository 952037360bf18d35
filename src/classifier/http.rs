//! HTTP-shaped classification over a transport-neutral capability trait.
//!
//! Transport crates stay downstream: they implement [`HttpAware`] on their
//! error types, and this module never imports them.

use super::{reason, AlwaysRetry, Classify, Outcome};
use crate::error::AttemptError;
use std::time::Duration;

/// The HTTP facts a classifier needs about a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpInfo {
    /// Response status; `0` means the request never got a response
    /// (connection reset, DNS failure, ...).
    pub status: u16,
    /// Request method, uppercase (`GET`, `POST`, ...).
    pub method: String,
    /// Server-provided Retry-After hint, if any.
    pub retry_after: Option<Duration>,
}

impl HttpInfo {
    pub fn new(status: u16, method: impl Into<String>) -> Self {
        Self { status, method: method.into().to_ascii_uppercase(), retry_after: None }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Capability trait for error types that can describe an HTTP exchange.
///
/// Returning `None` means "this error was not an HTTP call"; the classifiers
/// below fall back accordingly.
pub trait HttpAware {
    fn http(&self) -> Option<HttpInfo>;
}

/// RFC 9110 idempotent methods, the ones safe to replay blindly.
pub fn is_idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "TRACE")
}

/// Classifier for HTTP-backed operations.
///
/// Retries 5xx and 408/429 on idempotent methods (honoring Retry-After),
/// treats other 4xx as non-retryable, and refuses to guess on errors that
/// carry no HTTP details.
#[derive(Debug, Clone, Default)]
pub struct HttpClassifier {
    /// Extension statuses treated like 408/429 (retryable with Retry-After).
    pub extra_retryable_statuses: Vec<u16>,
}

impl HttpClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retryable_status(mut self, status: u16) -> Self {
        self.extra_retryable_statuses.push(status);
        self
    }

    fn classify_info(&self, info: &HttpInfo) -> Outcome {
        let idempotent = is_idempotent(&info.method);
        match info.status {
            200..=299 => Outcome::success(),
            0 => {
                if idempotent {
                    Outcome::retryable(reason::HTTP_TRANSPORT_ERROR)
                } else {
                    Outcome::non_retryable(reason::HTTP_TRANSPORT_ERROR)
                }
            }
            500..=599 => {
                if idempotent {
                    Outcome::retryable(reason::HTTP_5XX)
                } else {
                    Outcome::non_retryable(reason::HTTP_NON_IDEMPOTENT)
                }
            }
            status if status == 408 || status == 429 || self.extra_retryable_statuses.contains(&status) => {
                if !idempotent {
                    return Outcome::non_retryable(reason::HTTP_NON_IDEMPOTENT);
                }
                let reason = match status {
                    408 => reason::HTTP_408,
                    429 => reason::HTTP_429,
                    _ => reason::HTTP_429,
                };
                let mut outcome = Outcome::retryable(reason);
                if let Some(retry_after) = info.retry_after {
                    outcome = outcome.with_backoff_override(retry_after);
                }
                outcome
            }
            400..=499 => Outcome::non_retryable(reason::HTTP_NON_RETRYABLE_STATUS),
            _ => Outcome::non_retryable(reason::HTTP_NON_RETRYABLE_STATUS),
        }
    }
}

fn type_mismatch<E>() -> Outcome {
    Outcome::non_retryable(reason::CLASSIFIER_TYPE_MISMATCH)
        .with_attribute("expected_type", "HttpAware")
        .with_attribute("got_type", std::any::type_name::<E>())
}

impl<E: HttpAware + Send + Sync> Classify<E> for HttpClassifier {
    fn classify(&self, err: Option<&AttemptError<E>>) -> Outcome {
        match err {
            None => Outcome::success(),
            Some(AttemptError::Canceled) => Outcome::abort(reason::CONTEXT_CANCELED),
            Some(AttemptError::DeadlineExceeded) => {
                Outcome::retryable(reason::CONTEXT_DEADLINE_EXCEEDED)
            }
            Some(AttemptError::Panicked(_)) => Outcome::abort(reason::ABORT),
            Some(AttemptError::Inner(e)) => match e.http() {
                Some(info) => self.classify_info(&info),
                None => type_mismatch::<E>(),
            },
        }
    }
}

/// Delegates to [`HttpClassifier`] when the error carries HTTP details,
/// otherwise behaves like [`AlwaysRetry`].
#[derive(Debug, Clone, Default)]
pub struct AutoClassifier {
    http: HttpClassifier,
}

impl AutoClassifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: HttpAware + Send + Sync> Classify<E> for AutoClassifier {
    fn classify(&self, err: Option<&AttemptError<E>>) -> Outcome {
        if let Some(AttemptError::Inner(e)) = err {
            if e.http().is_some() {
                return self.http.classify(err);
            }
        }
        AlwaysRetry.classify(err)
    }
}
