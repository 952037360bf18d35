//! Shared helpers for the integration suites.

#![allow(dead_code)]

use palisade::{EffectivePolicy, HttpAware, HttpInfo, JitterKind, PolicyKey};
use std::fmt;
use std::time::Duration;

/// Plain operation error for retry-flow tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl TestError {
    pub fn new(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Operation error that can describe an HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpCallError {
    pub status: u16,
    pub method: &'static str,
    pub retry_after: Option<Duration>,
}

impl HttpCallError {
    pub fn status(status: u16, method: &'static str) -> Self {
        Self { status, method, retry_after: None }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl fmt::Display for HttpCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http {} {}", self.method, self.status)
    }
}

impl std::error::Error for HttpCallError {}

impl HttpAware for HttpCallError {
    fn http(&self) -> Option<HttpInfo> {
        let mut info = HttpInfo::new(self.status, self.method);
        if let Some(retry_after) = self.retry_after {
            info = info.with_retry_after(retry_after);
        }
        Some(info)
    }
}

/// A no-jitter retry policy with millisecond-scale backoff.
pub fn retry_policy(key: &PolicyKey, max_attempts: u32, initial_ms: u64, max_ms: u64) -> EffectivePolicy {
    let mut policy = EffectivePolicy::default_for(key);
    policy.retry.max_attempts = max_attempts;
    policy.retry.initial_backoff = Duration::from_millis(initial_ms);
    policy.retry.max_backoff = Duration::from_millis(max_ms);
    policy.retry.backoff_multiplier = 2.0;
    policy.retry.jitter = JitterKind::None;
    policy
}
