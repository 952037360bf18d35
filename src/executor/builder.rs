//! Fluent construction for [`Executor`].

use super::{Executor, MissingBudgetMode, MissingClassifierMode, MissingPolicyMode};
use crate::budget::{Budget, BudgetRegistry, EmptyBudgetName};
use crate::classifier::{
    AlwaysRetry, Classify, ClassifierRegistry, EmptyClassifierName,
};
use crate::clock::{Clock, MonotonicClock};
use crate::hedge::{EmptyTriggerName, HedgeTrigger, TriggerRegistry, DEFAULT_TRIGGER_POLL};
use crate::latency::{LatencyRegistry, DEFAULT_TRACKER_CAPACITY};
use crate::observe::{NoopObserver, Observer};
use crate::policy::{EffectivePolicy, PolicyKey};
use crate::provider::{PolicyProvider, StaticProvider};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`Executor`]. Every option has a production default; tests
/// usually swap in a manual clock, an instant sleeper, and static policies.
pub struct ExecutorBuilder<E> {
    provider: Option<Arc<dyn PolicyProvider>>,
    static_policies: Vec<(PolicyKey, EffectivePolicy)>,
    default_policy: Option<EffectivePolicy>,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    classifiers: ClassifierRegistry<E>,
    default_classifier: Arc<dyn Classify<E>>,
    budgets: BudgetRegistry,
    triggers: TriggerRegistry,
    recover_panics: bool,
    missing_policy: MissingPolicyMode,
    missing_classifier: MissingClassifierMode,
    missing_budget: MissingBudgetMode,
    tracker_capacity: usize,
    trigger_poll: Duration,
}

impl<E> ExecutorBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            provider: None,
            static_policies: Vec::new(),
            default_policy: None,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            classifiers: ClassifierRegistry::new(),
            default_classifier: Arc::new(AlwaysRetry),
            budgets: BudgetRegistry::new(),
            triggers: TriggerRegistry::with_builtins(),
            recover_panics: true,
            missing_policy: MissingPolicyMode::default(),
            missing_classifier: MissingClassifierMode::default(),
            missing_budget: MissingBudgetMode::default(),
            tracker_capacity: DEFAULT_TRACKER_CAPACITY,
            trigger_poll: DEFAULT_TRIGGER_POLL,
        }
    }

    /// Use an explicit provider. Overrides any inline static policies.
    pub fn provider(mut self, provider: Arc<dyn PolicyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register an inline static policy under a string key (`"ns.name"`).
    pub fn policy(mut self, key: &str, policy: EffectivePolicy) -> Self {
        self.static_policies.push((PolicyKey::parse(key), policy));
        self
    }

    /// Fallback policy for keys the static map does not contain.
    pub fn default_policy(mut self, policy: EffectivePolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Register a named classifier. Policies select it by name.
    pub fn classifier(
        mut self,
        name: &str,
        classifier: Arc<dyn Classify<E>>,
    ) -> Result<Self, EmptyClassifierName> {
        self.classifiers.register(name, classifier)?;
        Ok(self)
    }

    /// Classifier used when a policy names none.
    pub fn default_classifier(mut self, classifier: Arc<dyn Classify<E>>) -> Self {
        self.default_classifier = classifier;
        self
    }

    /// Register a named budget. Policies select it by name.
    pub fn budget(mut self, name: &str, budget: Arc<dyn Budget>) -> Result<Self, EmptyBudgetName> {
        self.budgets.register(name, budget)?;
        Ok(self)
    }

    /// Register a named hedge trigger. The `p50`/`p90`/`p95`/`p99` latency
    /// triggers are preloaded.
    pub fn trigger(
        mut self,
        name: &str,
        trigger: Arc<dyn HedgeTrigger>,
    ) -> Result<Self, EmptyTriggerName> {
        self.triggers.register(name, trigger)?;
        Ok(self)
    }

    pub fn recover_panics(mut self, recover: bool) -> Self {
        self.recover_panics = recover;
        self
    }

    pub fn missing_policy_mode(mut self, mode: MissingPolicyMode) -> Self {
        self.missing_policy = mode;
        self
    }

    pub fn missing_classifier_mode(mut self, mode: MissingClassifierMode) -> Self {
        self.missing_classifier = mode;
        self
    }

    pub fn missing_budget_mode(mut self, mode: MissingBudgetMode) -> Self {
        self.missing_budget = mode;
        self
    }

    /// Samples retained per key for latency-based hedge triggers.
    pub fn latency_capacity(mut self, capacity: usize) -> Self {
        self.tracker_capacity = capacity;
        self
    }

    /// How often triggers with no opinion are re-consulted.
    pub fn trigger_poll_interval(mut self, interval: Duration) -> Self {
        self.trigger_poll = interval;
        self
    }

    pub fn build(self) -> Executor<E> {
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let mut static_provider = StaticProvider::new();
                for (key, policy) in self.static_policies {
                    static_provider = static_provider.with_policy(key, policy);
                }
                if let Some(default) = self.default_policy {
                    static_provider = static_provider.with_default(default);
                }
                Arc::new(static_provider)
            }
        };

        Executor {
            provider,
            observer: self.observer,
            clock: self.clock.clone(),
            sleeper: self.sleeper,
            classifiers: self.classifiers,
            default_classifier: self.default_classifier,
            budgets: self.budgets,
            triggers: self.triggers,
            breakers: crate::breaker::BreakerRegistry::new(self.clock),
            trackers: LatencyRegistry::new(self.tracker_capacity),
            recover_panics: self.recover_panics,
            missing_policy: self.missing_policy,
            missing_classifier: self.missing_classifier,
            missing_budget: self.missing_budget,
            trigger_poll: self.trigger_poll,
        }
    }
}

impl<E> Default for ExecutorBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
