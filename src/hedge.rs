//! Hedge triggers: when to launch speculative sibling attempts.

use crate::latency::LatencySnapshot;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// How often the executor re-consults a trigger that expressed no opinion.
pub const DEFAULT_TRIGGER_POLL: Duration = Duration::from_millis(25);

/// Everything a trigger may consider when deciding whether to hedge.
///
/// Passed fresh to every check; triggers hold no per-call state.
#[derive(Debug, Clone)]
pub struct HedgeState {
    /// Call start, milliseconds on the executor clock.
    pub call_start_ms: u64,
    /// Current retry slot start, milliseconds on the executor clock.
    pub attempt_start_ms: u64,
    /// Attempts launched in this slot so far (primary included).
    pub attempts_launched: u32,
    /// Hedge budget for this slot.
    pub max_hedges: u32,
    /// Time since the slot's primary launched.
    pub elapsed: Duration,
    /// Latency quantiles for this policy key.
    pub snapshot: LatencySnapshot,
    /// The policy's fixed hedge delay.
    pub hedge_delay: Duration,
}

/// A trigger's answer for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HedgeDecision {
    pub spawn: bool,
    /// When to check again. Zero means "no opinion" and the executor polls at
    /// [`DEFAULT_TRIGGER_POLL`].
    pub next_check_in: Duration,
}

impl HedgeDecision {
    pub fn spawn_now() -> Self {
        Self { spawn: true, next_check_in: Duration::ZERO }
    }

    pub fn check_in(next_check_in: Duration) -> Self {
        Self { spawn: false, next_check_in }
    }

    pub fn no_opinion() -> Self {
        Self { spawn: false, next_check_in: Duration::ZERO }
    }
}

/// Decides when the executor should launch another concurrent attempt.
pub trait HedgeTrigger: Send + Sync {
    fn should_spawn(&self, state: &HedgeState) -> HedgeDecision;
}

/// Spawns a single hedge once a fixed delay has elapsed.
///
/// Also the fallback when a policy names a trigger that is not registered.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelayTrigger {
    pub delay: Duration,
}

impl FixedDelayTrigger {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl HedgeTrigger for FixedDelayTrigger {
    fn should_spawn(&self, state: &HedgeState) -> HedgeDecision {
        if state.elapsed < self.delay {
            return HedgeDecision::check_in(self.delay - state.elapsed);
        }
        // Fire exactly once per slot: only while just the primary is out.
        if state.attempts_launched <= 1 {
            HedgeDecision::spawn_now()
        } else {
            HedgeDecision::no_opinion()
        }
    }
}

/// Spawns hedges once the slot has outlived a latency quantile for its key.
#[derive(Debug, Clone)]
pub struct LatencyTrigger {
    /// Quantile name: `p50`, `p90`, `p95`, or `p99`.
    pub percentile: String,
}

impl LatencyTrigger {
    pub fn new(percentile: impl Into<String>) -> Self {
        Self { percentile: percentile.into() }
    }
}

impl HedgeTrigger for LatencyTrigger {
    fn should_spawn(&self, state: &HedgeState) -> HedgeDecision {
        let threshold = match state.snapshot.percentile(&self.percentile) {
            Some(t) => t,
            None => {
                tracing::debug!(percentile = %self.percentile, "unknown hedge percentile");
                return HedgeDecision::no_opinion();
            }
        };
        if threshold.is_zero() {
            // Not enough samples yet; let the executor poll.
            return HedgeDecision::no_opinion();
        }
        if state.elapsed > threshold && state.attempts_launched < 1 + state.max_hedges {
            HedgeDecision::spawn_now()
        } else {
            HedgeDecision::check_in(threshold.saturating_sub(state.elapsed))
        }
    }
}

/// Thread-safe `name → trigger` map. Names are whitespace-trimmed.
#[derive(Default)]
pub struct TriggerRegistry {
    inner: RwLock<HashMap<String, Arc<dyn HedgeTrigger>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger. Empty names are rejected; re-registration replaces.
    pub fn register(&self, name: &str, trigger: Arc<dyn HedgeTrigger>) -> Result<(), EmptyTriggerName> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EmptyTriggerName);
        }
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), trigger);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HedgeTrigger>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name.trim())
            .cloned()
    }

    /// Registry preloaded with the latency triggers every policy can name.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for percentile in ["p50", "p90", "p95", "p99"] {
            registry
                .register(percentile, Arc::new(LatencyTrigger::new(percentile)))
                .unwrap_or_else(|_| unreachable!("builtin trigger names are non-empty"));
        }
        registry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("trigger name must not be empty")]
pub struct EmptyTriggerName;
