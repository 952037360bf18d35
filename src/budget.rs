//! Attempt budgets: rate/permit authorities gating retries and hedges.

use crate::clock::{Clock, MonotonicClock};
use crate::policy::PolicyKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Stable reason strings for budget decisions.
pub mod reason {
    pub const ALLOWED: &str = "allowed";
    pub const NO_BUDGET: &str = "no_budget";
    pub const BUDGET_DENIED: &str = "budget_denied";
    pub const BUDGET_NOT_FOUND: &str = "budget_not_found";
    pub const PANIC_IN_BUDGET: &str = "panic_in_budget";
}

/// Whether the attempt being gated is a retry-slot primary or a hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Retry,
    Hedge,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptKind::Retry => "retry",
            AttemptKind::Hedge => "hedge",
        }
    }
}

/// One attempt asking for permission.
#[derive(Debug, Clone)]
pub struct BudgetRequest<'a> {
    pub key: &'a PolicyKey,
    /// Retry-slot index, 0-based.
    pub attempt_index: u32,
    pub kind: AttemptKind,
    /// Budget name from the policy.
    pub name: &'a str,
    /// Cost the policy assigns this attempt; budgets treat it as at least 1.
    pub cost: u64,
}

/// Callback transferring a permit back to the budget.
pub type Release = Box<dyn FnOnce() + Send>;

/// A budget's answer for one attempt.
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    /// Optional permit return. The executor guarantees it runs exactly once
    /// after the attempt finishes, including denial and cancellation paths.
    pub release: Option<Release>,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into(), release: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: reason.into(), release: None }
    }

    pub fn with_release(mut self, release: Release) -> Self {
        self.release = Some(release);
        self
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decision")
            .field("allowed", &self.allowed)
            .field("reason", &self.reason)
            .field("release", &self.release.as_ref().map(|_| "<release>"))
            .finish()
    }
}

/// A rate/permit authority gating attempts.
pub trait Budget: Send + Sync {
    fn allow_attempt(&self, req: &BudgetRequest<'_>) -> Decision;
}

/// Budget that always allows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Budget for Unlimited {
    fn allow_attempt(&self, _req: &BudgetRequest<'_>) -> Decision {
        Decision::allow(reason::ALLOWED)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

/// Continuously refilling token bucket.
///
/// Starts full; each allowed attempt debits `max(cost, 1)` tokens. Backwards
/// clock movement refills nothing.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::with_clock(capacity, refill_per_sec, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(capacity: f64, refill_per_sec: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = sanitize(capacity);
        let refill_per_sec = sanitize(refill_per_sec);
        let now = clock.now_millis();
        Self {
            capacity,
            refill_per_sec,
            clock,
            state: Mutex::new(BucketState { tokens: capacity, last_refill_ms: now }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState, now: u64) {
        if now <= state.last_refill_ms {
            // Clock went backwards (or stood still): no refill.
            return;
        }
        let elapsed_ms = now - state.last_refill_ms;
        let refill = self.refill_per_sec * (elapsed_ms as f64 / 1000.0);
        state.tokens = (state.tokens + refill).min(self.capacity);
        state.last_refill_ms = now;
    }
}

fn sanitize(v: f64) -> f64 {
    if v.is_finite() && v >= 0.0 {
        v
    } else {
        0.0
    }
}

impl Budget for TokenBucket {
    fn allow_attempt(&self, req: &BudgetRequest<'_>) -> Decision {
        let cost = req.cost.max(1) as f64;
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill_locked(&mut state, now);

        if state.tokens >= cost {
            state.tokens -= cost;
            Decision::allow(reason::ALLOWED)
        } else {
            tracing::debug!(
                key = %req.key,
                attempt = req.attempt_index,
                kind = req.kind.as_str(),
                tokens = state.tokens,
                cost,
                "token bucket denied attempt"
            );
            Decision::deny(reason::BUDGET_DENIED)
        }
    }
}

/// Error from [`BudgetRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("budget name must not be empty")]
pub struct EmptyBudgetName;

/// Thread-safe `name → budget` map. Names are whitespace-trimmed.
#[derive(Default)]
pub struct BudgetRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Budget>>>,
}

impl BudgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, budget: Arc<dyn Budget>) -> Result<(), EmptyBudgetName> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EmptyBudgetName);
        }
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), budget);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Budget>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name.trim())
            .cloned()
    }
}

/// Once-latch around a budget release.
///
/// Fires on explicit completion or on drop, whichever comes first, so a
/// cancelled or panicking attempt still returns its permit exactly once.
#[derive(Default)]
pub(crate) struct ReleaseGuard {
    release: Option<Release>,
}

impl ReleaseGuard {
    pub(crate) fn new(release: Option<Release>) -> Self {
        Self { release }
    }

    pub(crate) fn fire(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request<'a>(key: &'a PolicyKey, attempt: u32, cost: u64) -> BudgetRequest<'a> {
        BudgetRequest {
            key,
            attempt_index: attempt,
            kind: AttemptKind::Retry,
            name: "bucket",
            cost,
        }
    }

    #[test]
    fn unlimited_always_allows() {
        let key = PolicyKey::parse("svc.op");
        let decision = Unlimited.allow_attempt(&request(&key, 0, 5));
        assert!(decision.allowed);
        assert_eq!(decision.reason, reason::ALLOWED);
    }

    #[test]
    fn token_bucket_starts_full_and_debits() {
        let key = PolicyKey::parse("svc.op");
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(2.0, 0.0, Arc::new(clock));

        assert!(bucket.allow_attempt(&request(&key, 0, 1)).allowed);
        assert!(bucket.allow_attempt(&request(&key, 1, 1)).allowed);
        let denied = bucket.allow_attempt(&request(&key, 2, 1));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, reason::BUDGET_DENIED);
    }

    #[test]
    fn token_bucket_refills_continuously() {
        let key = PolicyKey::parse("svc.op");
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(1.0, 2.0, Arc::new(clock.clone()));

        assert!(bucket.allow_attempt(&request(&key, 0, 1)).allowed);
        assert!(!bucket.allow_attempt(&request(&key, 1, 1)).allowed);

        // 2 tokens/sec: 500ms buys one token back.
        clock.advance(Duration::from_millis(500));
        assert!(bucket.allow_attempt(&request(&key, 2, 1)).allowed);
    }

    #[test]
    fn token_bucket_clamps_to_capacity() {
        let key = PolicyKey::parse("svc.op");
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(2.0, 10.0, Arc::new(clock.clone()));

        clock.advance(Duration::from_secs(60));
        assert!(bucket.allow_attempt(&request(&key, 0, 2)).allowed);
        assert!(!bucket.allow_attempt(&request(&key, 1, 1)).allowed, "refill must clamp");
    }

    #[test]
    fn token_bucket_treats_zero_cost_as_one() {
        let key = PolicyKey::parse("svc.op");
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(1.0, 0.0, Arc::new(clock));

        assert!(bucket.allow_attempt(&request(&key, 0, 0)).allowed);
        assert!(!bucket.allow_attempt(&request(&key, 1, 0)).allowed);
    }

    #[test]
    fn token_bucket_survives_backwards_clock() {
        let key = PolicyKey::parse("svc.op");
        let clock = ManualClock::new();
        clock.set_millis(10_000);
        let bucket = TokenBucket::with_clock(1.0, 100.0, Arc::new(clock.clone()));

        assert!(bucket.allow_attempt(&request(&key, 0, 1)).allowed);
        clock.set_millis(0); // skew backwards
        assert!(!bucket.allow_attempt(&request(&key, 1, 1)).allowed, "no refill on skew");
    }

    #[test]
    fn token_bucket_sanitizes_nan_and_infinity() {
        let key = PolicyKey::parse("svc.op");
        let bucket = TokenBucket::new(f64::NAN, f64::INFINITY);
        assert!(!bucket.allow_attempt(&request(&key, 0, 1)).allowed);
    }

    #[test]
    fn release_guard_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let mut guard = ReleaseGuard::new(Some(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })));
        guard.fire();
        guard.fire();
        drop(guard);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_guard_fires_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        {
            let _guard = ReleaseGuard::new(Some(Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_round_trip() {
        let registry = BudgetRegistry::new();
        registry.register("calls", Arc::new(Unlimited)).unwrap();
        assert!(registry.get(" calls ").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.register("", Arc::new(Unlimited)), Err(EmptyBudgetName));
    }
}
