//! Observation surface: attempt records, call timelines, and observers.

use crate::budget::AttemptKind;
use crate::classifier::Outcome;
use crate::policy::{EffectivePolicy, PolicyKey};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::time::Duration;

/// Reason an in-flight hedge attempt was cancelled.
pub const PEER_WON: &str = "peer_won";

/// Metadata attached to every attempt's context, readable by user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptInfo {
    /// Retry-slot index, 0-based.
    pub retry_index: u32,
    /// Launch ordinal across the whole call, 0-based.
    pub attempt: u32,
    pub is_hedge: bool,
    /// 0 for the slot primary, 1..N for hedges in spawn order.
    pub hedge_index: u32,
    pub policy_id: String,
}

/// One attempt's finished record. Appended in completion order; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Retry-slot index, 0-based.
    pub attempt: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub is_hedge: bool,
    pub hedge_index: u32,
    /// Classified outcome; absent for attempts denied by budget or aborted
    /// before producing one.
    pub outcome: Option<Outcome>,
    /// Display form of the attempt error, if any.
    pub error: Option<String>,
    /// Backoff scheduled after this attempt's slot, zero if none.
    pub backoff: Duration,
    pub budget_allowed: bool,
    pub budget_reason: String,
}

/// The structured, post-hoc record of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub key: PolicyKey,
    pub policy_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub attributes: Vec<(String, String)>,
    pub attempts: Vec<AttemptRecord>,
    pub final_error: Option<String>,
}

impl Timeline {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn hedge_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_hedge).count()
    }
}

/// A budget decision as observers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetEvent {
    pub key: PolicyKey,
    pub attempt_index: u32,
    pub kind: AttemptKind,
    pub name: String,
    pub allowed: bool,
    pub reason: String,
}

/// Receives structured events over a call's lifetime.
///
/// Callbacks may run on any worker; implementations must be re-entrant and
/// non-blocking. All methods default to no-ops.
pub trait Observer: Send + Sync {
    fn on_start(&self, _key: &PolicyKey, _policy: &EffectivePolicy) {}
    fn on_attempt(&self, _key: &PolicyKey, _record: &AttemptRecord) {}
    fn on_hedge_spawn(&self, _key: &PolicyKey, _info: &AttemptInfo) {}
    fn on_hedge_cancel(&self, _key: &PolicyKey, _info: &AttemptInfo, _reason: &str) {}
    fn on_budget_decision(&self, _event: &BudgetEvent) {}
    fn on_success(&self, _key: &PolicyKey, _timeline: &Timeline) {}
    fn on_failure(&self, _key: &PolicyKey, _timeline: &Timeline) {}
}

/// Observer that ignores everything. The executor default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Fans every event out to a list of observers, in registration order.
#[derive(Default)]
pub struct MulticastObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MulticastObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }
}

impl Observer for MulticastObserver {
    fn on_start(&self, key: &PolicyKey, policy: &EffectivePolicy) {
        for o in &self.observers {
            o.on_start(key, policy);
        }
    }

    fn on_attempt(&self, key: &PolicyKey, record: &AttemptRecord) {
        for o in &self.observers {
            o.on_attempt(key, record);
        }
    }

    fn on_hedge_spawn(&self, key: &PolicyKey, info: &AttemptInfo) {
        for o in &self.observers {
            o.on_hedge_spawn(key, info);
        }
    }

    fn on_hedge_cancel(&self, key: &PolicyKey, info: &AttemptInfo, reason: &str) {
        for o in &self.observers {
            o.on_hedge_cancel(key, info, reason);
        }
    }

    fn on_budget_decision(&self, event: &BudgetEvent) {
        for o in &self.observers {
            o.on_budget_decision(event);
        }
    }

    fn on_success(&self, key: &PolicyKey, timeline: &Timeline) {
        for o in &self.observers {
            o.on_success(key, timeline);
        }
    }

    fn on_failure(&self, key: &PolicyKey, timeline: &Timeline) {
        for o in &self.observers {
            o.on_failure(key, timeline);
        }
    }
}

/// Observer that logs lifecycle events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_start(&self, key: &PolicyKey, policy: &EffectivePolicy) {
        tracing::debug!(key = %key, policy = %policy.id, "call started");
    }

    fn on_attempt(&self, key: &PolicyKey, record: &AttemptRecord) {
        tracing::debug!(
            key = %key,
            attempt = record.attempt,
            hedge = record.is_hedge,
            allowed = record.budget_allowed,
            outcome = record.outcome.as_ref().map(|o| o.reason.as_str()),
            "attempt finished"
        );
    }

    fn on_hedge_spawn(&self, key: &PolicyKey, info: &AttemptInfo) {
        tracing::debug!(key = %key, hedge_index = info.hedge_index, "hedge launched");
    }

    fn on_hedge_cancel(&self, key: &PolicyKey, info: &AttemptInfo, reason: &str) {
        tracing::debug!(key = %key, hedge_index = info.hedge_index, reason, "attempt cancelled");
    }

    fn on_budget_decision(&self, event: &BudgetEvent) {
        tracing::debug!(
            key = %event.key,
            budget = %event.name,
            allowed = event.allowed,
            reason = %event.reason,
            "budget decision"
        );
    }

    fn on_success(&self, key: &PolicyKey, timeline: &Timeline) {
        tracing::info!(key = %key, attempts = timeline.attempts.len(), "call succeeded");
    }

    fn on_failure(&self, key: &PolicyKey, timeline: &Timeline) {
        tracing::warn!(
            key = %key,
            attempts = timeline.attempts.len(),
            error = timeline.final_error.as_deref().unwrap_or(""),
            "call failed"
        );
    }
}

/// Observer that retains finished timelines in memory, oldest evicted first.
///
/// Meant for tests and diagnostics, not production retention.
#[derive(Debug, Clone)]
pub struct MemoryObserver {
    timelines: Arc<std::sync::Mutex<Vec<Timeline>>>,
    capacity: usize,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timelines: Arc::new(std::sync::Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn timelines(&self) -> Vec<Timeline> {
        self.timelines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.timelines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    fn retain(&self, timeline: &Timeline) {
        let mut guard = self
            .timelines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
        }
        guard.push(timeline.clone());
    }
}

impl Default for MemoryObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for MemoryObserver {
    fn on_success(&self, _key: &PolicyKey, timeline: &Timeline) {
        self.retain(timeline);
    }

    fn on_failure(&self, _key: &PolicyKey, timeline: &Timeline) {
        self.retain(timeline);
    }
}

/// Opt-in holder the executor publishes a call's finalized [`Timeline`] into.
///
/// Obtained from [`CallContext::record_timeline`]; read after the call
/// returns. Publication is a single atomic pointer store.
///
/// [`CallContext::record_timeline`]: crate::context::CallContext::record_timeline
#[derive(Clone, Default)]
pub struct TimelineCapture {
    slot: Arc<ArcSwapOption<Timeline>>,
}

impl TimelineCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finalized timeline, once the call has completed.
    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.slot.load_full()
    }

    pub(crate) fn publish(&self, timeline: Timeline) {
        self.slot.store(Some(Arc::new(timeline)));
    }
}

impl std::fmt::Debug for TimelineCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineCapture")
            .field("captured", &self.timeline().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::OutcomeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn timeline(key: &PolicyKey) -> Timeline {
        Timeline {
            key: key.clone(),
            policy_id: "static:test".to_string(),
            start_ms: 0,
            end_ms: 10,
            attributes: vec![("policy_source".to_string(), "static".to_string())],
            attempts: vec![],
            final_error: None,
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn on_success(&self, _key: &PolicyKey, _timeline: &Timeline) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _key: &PolicyKey, _timeline: &Timeline) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn timeline_attribute_lookup() {
        let key = PolicyKey::parse("svc.op");
        let t = timeline(&key);
        assert_eq!(t.attribute("policy_source"), Some("static"));
        assert_eq!(t.attribute("missing"), None);
    }

    #[test]
    fn timeline_counts_hedges() {
        let key = PolicyKey::parse("svc.op");
        let mut t = timeline(&key);
        t.attempts.push(AttemptRecord {
            attempt: 0,
            start_ms: 0,
            end_ms: 5,
            is_hedge: true,
            hedge_index: 1,
            outcome: Some(Outcome::new(OutcomeKind::Success, "success")),
            error: None,
            backoff: Duration::ZERO,
            budget_allowed: true,
            budget_reason: "allowed".to_string(),
        });
        assert_eq!(t.hedge_attempts(), 1);
    }

    #[test]
    fn multicast_fans_out_in_order() {
        let key = PolicyKey::parse("svc.op");
        let a = Arc::new(CountingObserver::default());
        let b = Arc::new(CountingObserver::default());
        let multi = MulticastObserver::new(vec![a.clone(), b.clone()]);

        multi.on_success(&key, &timeline(&key));
        multi.on_failure(&key, &timeline(&key));
        multi.on_failure(&key, &timeline(&key));

        for o in [&a, &b] {
            assert_eq!(o.successes.load(Ordering::SeqCst), 1);
            assert_eq!(o.failures.load(Ordering::SeqCst), 2);
        }
    }

    #[test]
    fn capture_is_empty_until_published() {
        let capture = TimelineCapture::new();
        assert!(capture.timeline().is_none());

        let key = PolicyKey::parse("svc.op");
        capture.publish(timeline(&key));
        let seen = capture.timeline().expect("published");
        assert_eq!(seen.key, key);
    }

    #[test]
    fn capture_clones_share_the_slot() {
        let capture = TimelineCapture::new();
        let reader = capture.clone();
        capture.publish(timeline(&PolicyKey::parse("svc.op")));
        assert!(reader.timeline().is_some());
    }

    #[test]
    fn memory_observer_retains_up_to_capacity() {
        let key = PolicyKey::parse("svc.op");
        let observer = MemoryObserver::with_capacity(2);

        let mut first = timeline(&key);
        first.policy_id = "one".to_string();
        observer.on_success(&key, &first);
        let mut second = timeline(&key);
        second.policy_id = "two".to_string();
        observer.on_failure(&key, &second);
        let mut third = timeline(&key);
        third.policy_id = "three".to_string();
        observer.on_success(&key, &third);

        let retained = observer.timelines();
        assert_eq!(retained.len(), 2, "oldest timeline evicted");
        assert_eq!(retained[0].policy_id, "two");
        assert_eq!(retained[1].policy_id, "three");

        observer.clear();
        assert!(observer.timelines().is_empty());
    }
}
