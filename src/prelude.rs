//! Convenience re-exports for the common path.
//!
//! ```rust
//! use palisade::prelude::*;
//! ```

pub use crate::breaker::CircuitState;
pub use crate::budget::{AttemptKind, Budget, Decision, TokenBucket, Unlimited};
pub use crate::classifier::{
    AlwaysRetry, AutoClassifier, Classify, HttpAware, HttpClassifier, HttpInfo, Outcome,
    OutcomeKind,
};
pub use crate::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::context::{AttemptContext, CallContext, CtxError};
pub use crate::error::{AttemptError, ExecError, PanicError};
pub use crate::executor::{
    Executor, ExecutorBuilder, MissingBudgetMode, MissingClassifierMode, MissingPolicyMode,
};
pub use crate::hedge::{FixedDelayTrigger, HedgeTrigger, LatencyTrigger};
pub use crate::jitter::JitterKind;
pub use crate::observe::{Observer, Timeline, TimelineCapture};
pub use crate::policy::{
    BudgetRef, CircuitPolicy, EffectivePolicy, HedgePolicy, PolicyKey, RetryPolicy,
};
pub use crate::provider::{CachedProvider, PolicyProvider, PolicySource, StaticProvider};
pub use crate::sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
