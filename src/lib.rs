#![forbid(unsafe_code)]

//! # Palisade
//!
//! Policy-driven resilience execution for async Rust: retries, request
//! hedging, client-side circuit breaking, cost budgets, pluggable outcome
//! classification, and structured call timelines.
//!
//! ## How it works
//!
//! Callers hand the [`Executor`] a *policy key* and an operation. The
//! executor resolves the key to an [`EffectivePolicy`] (static map or cached
//! remote source), gates the call through the key's circuit breaker, then
//! drives the retry loop: each retry slot runs a primary attempt and, when
//! hedging is enabled, speculative siblings launched by a hedge trigger. A
//! classifier turns each attempt's result into an [`Outcome`] that decides
//! whether to stop, back off and retry, or fail fast.
//!
//! ## Features
//!
//! - **Retries** with exponential backoff, jitter, and Retry-After overrides
//! - **Hedging** on fixed delays or per-key latency quantiles
//! - **Circuit breaking** with half-open probe accounting, per policy key
//! - **Budgets** gating attempts with token buckets or custom authorities
//! - **Observation** via observer callbacks and opt-in call timelines
//! - **Deterministic tests** via injectable clock and sleeper seams
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use palisade::{CallContext, EffectivePolicy, Executor, JitterKind, PolicyKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = PolicyKey::parse("payments.charge");
//!     let mut policy = EffectivePolicy::default_for(&key);
//!     policy.retry.max_attempts = 3;
//!     policy.retry.initial_backoff = Duration::from_millis(10);
//!     policy.retry.jitter = JitterKind::None;
//!
//!     let executor: Executor<std::io::Error> = Executor::builder()
//!         .policy("payments.charge", policy)
//!         .build();
//!
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!     let ctx = CallContext::background();
//!     let value = executor
//!         .execute(&ctx, &key, |_attempt| {
//!             let attempts = attempts.clone();
//!             async move {
//!                 if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
//!                     Err(std::io::Error::new(std::io::ErrorKind::Other, "transient"))
//!                 } else {
//!                     Ok(42_u32)
//!                 }
//!             }
//!         })
//!         .await?;
//!
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```

mod breaker;
mod budget;
mod classifier;
mod clock;
mod context;
mod error;
mod executor;
mod hedge;
mod jitter;
mod latency;
mod observe;
mod policy;
mod provider;
mod sleeper;

// Re-exports
pub use breaker::{
    AllowDecision, BreakerRegistry, CircuitBreaker, CircuitState, CIRCUIT_HALF_OPEN_PROBE_LIMIT,
    CIRCUIT_OPEN,
};
pub use budget::{
    reason as budget_reason, AttemptKind, Budget, BudgetRegistry, BudgetRequest, Decision,
    EmptyBudgetName, Release, TokenBucket, Unlimited,
};
pub use classifier::{
    reason, AlwaysRetry, AutoClassifier, Classify, ClassifierRegistry, EmptyClassifierName,
    HttpAware, HttpClassifier, HttpInfo, Outcome, OutcomeKind,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::{AttemptContext, CallContext, CtxError};
pub use error::{AttemptError, ExecError, PanicError};
pub use executor::{
    Executor, ExecutorBuilder, MissingBudgetMode, MissingClassifierMode, MissingPolicyMode,
};
pub use hedge::{
    EmptyTriggerName, FixedDelayTrigger, HedgeDecision, HedgeState, HedgeTrigger, LatencyTrigger,
    TriggerRegistry, DEFAULT_TRIGGER_POLL,
};
pub use jitter::{JitterKind, UnknownJitter};
pub use latency::{LatencyRegistry, LatencySnapshot, RingBufferTracker, DEFAULT_TRACKER_CAPACITY};
pub use observe::{
    AttemptInfo, AttemptRecord, BudgetEvent, LogObserver, MemoryObserver, MulticastObserver,
    NoopObserver, Observer, Timeline, TimelineCapture, PEER_WON,
};
pub use policy::{
    BudgetRef, CircuitPolicy, EffectivePolicy, HedgePolicy, Normalization, PolicyKey, PolicyMeta,
    PolicyOrigin, RetryPolicy, MAX_ATTEMPTS_CEILING, MAX_BACKOFF_CEILING, MAX_HEDGES_CEILING,
    MIN_BACKOFF,
};
pub use provider::{
    CachedProvider, PolicyError, PolicyProvider, PolicySource, StaticProvider,
    DEFAULT_NEGATIVE_TTL, DEFAULT_POSITIVE_TTL,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;
