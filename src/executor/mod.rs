//! The executor: policy resolution, circuit gating, the retry loop, and the
//! hedged attempt group, composed into one call.

mod builder;
mod call;

pub use builder::ExecutorBuilder;

use crate::breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
use crate::budget::{Budget, BudgetRegistry};
use crate::classifier::{Classify, ClassifierRegistry, Outcome, OutcomeKind};
use crate::clock::Clock;
use crate::context::{AttemptContext, CallContext, CtxError};
use crate::error::{AttemptError, ExecError, PanicError};
use crate::hedge::TriggerRegistry;
use crate::latency::{LatencyRegistry, RingBufferTracker};
use crate::observe::{Observer, Timeline};
use crate::policy::{EffectivePolicy, PolicyKey};
use crate::provider::{PolicyError, PolicyProvider};
use crate::sleeper::Sleeper;
use call::{panic_message, CallState, SlotVerdict};
use futures::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// What to do when policy resolution fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicyMode {
    /// Surface a `NoPolicy` error.
    #[default]
    Deny,
    /// Run with a minimal single-attempt policy.
    Allow,
    /// Substitute built-in defaults when the source has no policy.
    Fallback,
}

/// What to do when a policy names an unregistered classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingClassifierMode {
    /// Surface a `NoClassifier` error.
    Deny,
    /// Use the executor's default classifier.
    #[default]
    Fallback,
}

/// What to do when a policy names an unregistered budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingBudgetMode {
    /// Deny attempts with `budget_not_found`.
    #[default]
    Deny,
    /// Allow attempts anyway, keeping the `budget_not_found` reason visible.
    AllowUnsafe,
}

/// How a policy's budget name resolved for one call.
pub(crate) enum BudgetBinding {
    /// The policy names no budget.
    None,
    Bound(Arc<dyn Budget>),
    Missing { allow_unsafe: bool },
}

/// The resilience executor.
///
/// Owns the registries (classifiers, budgets, triggers, breakers, latency
/// trackers) and drives each call through policy resolution, circuit gating,
/// the retry loop, and per-slot hedging. Construct one with
/// [`Executor::builder`] and share it; every method takes `&self`.
pub struct Executor<E> {
    pub(crate) provider: Arc<dyn PolicyProvider>,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) classifiers: ClassifierRegistry<E>,
    pub(crate) default_classifier: Arc<dyn Classify<E>>,
    pub(crate) budgets: BudgetRegistry,
    pub(crate) triggers: TriggerRegistry,
    pub(crate) breakers: BreakerRegistry,
    pub(crate) trackers: LatencyRegistry,
    pub(crate) recover_panics: bool,
    pub(crate) missing_policy: MissingPolicyMode,
    pub(crate) missing_classifier: MissingClassifierMode,
    pub(crate) missing_budget: MissingBudgetMode,
    pub(crate) trigger_poll: Duration,
}

impl<E> Executor<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ExecutorBuilder<E> {
        ExecutorBuilder::new()
    }

    /// Latency tracker for a key, created on first use. Exposed so adapters
    /// can prime or inspect the sample window.
    pub fn latency_tracker(&self, key: &PolicyKey) -> Arc<RingBufferTracker> {
        self.trackers.get_or_create(key)
    }

    /// Current breaker state for a key, if one has been created.
    pub fn breaker_state(&self, key: &PolicyKey) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.state())
    }

    /// Force a key's breaker back to Closed. Returns false when no breaker
    /// exists for the key.
    pub fn reset_breaker(&self, key: &PolicyKey) -> bool {
        self.breakers.reset(key)
    }

    /// Execute `op` under the policy for `key`, without a return value.
    pub async fn run<F, Fut>(
        &self,
        ctx: &CallContext,
        key: &PolicyKey,
        op: F,
    ) -> Result<(), ExecError<E>>
    where
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
    {
        self.execute(ctx, key, op).await
    }

    /// Execute `op` under the policy for `key`.
    ///
    /// The operation may be invoked several times, concurrently when hedging
    /// is enabled; it must honor the [`AttemptContext`] it receives and be
    /// safe to replay.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &CallContext,
        key: &PolicyKey,
        op: F,
    ) -> Result<T, ExecError<E>>
    where
        T: Send,
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let start_ms = self.clock.now_millis();

        // Step 1: policy resolution, always normalized.
        let policy = match self.resolve_policy(key).await {
            Ok(policy) => policy,
            Err(err) => {
                self.publish_early_failure(ctx, key, start_ms, &err);
                return Err(err);
            }
        };

        let state = CallState::new(
            key.clone(),
            policy.id.clone(),
            start_ms,
            self.trackers.get_or_create(key),
        );
        state.push_attribute("policy_source", policy.meta.origin.as_str());
        if policy.meta.normalization.changed {
            state.push_attribute("policy_normalized", "true");
            state.push_attribute(
                "policy_clamped_fields",
                policy.meta.normalization.changed_fields.join(","),
            );
        }

        // Step 3: classifier resolution.
        let classifier = match self.resolve_classifier(&state, &policy) {
            Ok(classifier) => classifier,
            Err(err) => {
                let timeline = state.finalize(self.clock.now_millis(), Some(err.to_string()));
                self.publish(ctx, timeline);
                return Err(err);
            }
        };

        // Step 4: overall deadline bounds the whole call, sleeps included.
        let call_ctx = match policy.retry.overall_timeout {
            Some(timeout) if !timeout.is_zero() => ctx.with_timeout(timeout),
            _ => ctx.clone(),
        };

        // Step 5: circuit gate, before any attempt.
        let mut breaker: Option<Arc<CircuitBreaker>> = None;
        let mut breaker_half_open = false;
        if policy.circuit.enabled {
            let gate = self.breakers.get_or_create(key, &policy.circuit);
            let decision = gate.allow();
            if !decision.allowed {
                let state_name = match decision.state {
                    CircuitState::Open => "open",
                    CircuitState::HalfOpen => "half_open",
                    CircuitState::Closed => "closed",
                };
                state.push_attribute("circuit_state", state_name);
                self.observer.on_start(key, &policy);
                let err: ExecError<E> = ExecError::CircuitOpen {
                    state: decision.state,
                    reason: decision.reason,
                };
                let timeline = state.finalize(self.clock.now_millis(), Some(err.to_string()));
                self.observer.on_failure(key, &timeline);
                self.publish(ctx, timeline);
                return Err(err);
            }
            breaker_half_open = decision.state == CircuitState::HalfOpen;
            breaker = Some(gate);
        }

        self.observer.on_start(key, &policy);

        let budget = self.bind_budget(&policy);
        // Hedge launches are disabled while probing a half-open breaker.
        let hedging_active = policy.hedge.enabled && !breaker_half_open;

        // Step 6: the retry loop. Slots are strictly sequential.
        let mut backoff = policy.retry.initial_backoff;
        let mut last: Option<(Outcome, Option<AttemptError<E>>)> = None;

        for slot in 0..policy.retry.max_attempts {
            if let Some(ctx_err) = call_ctx.err() {
                return Err(self.finish_failure(
                    &state,
                    ctx,
                    breaker.as_deref(),
                    Self::ctx_exec_error(ctx_err),
                ));
            }

            let verdict = self
                .run_slot(
                    &state,
                    &call_ctx,
                    &op,
                    &policy,
                    &classifier,
                    &budget,
                    hedging_active,
                    slot,
                )
                .await;

            match verdict {
                SlotVerdict::Success(value) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    let timeline = state.finalize(self.clock.now_millis(), None);
                    self.observer.on_success(key, &timeline);
                    self.publish(ctx, timeline);
                    return Ok(value);
                }
                SlotVerdict::CtxDone => {
                    let ctx_err = call_ctx.err().unwrap_or(CtxError::Canceled);
                    return Err(self.finish_failure(
                        &state,
                        ctx,
                        breaker.as_deref(),
                        Self::ctx_exec_error(ctx_err),
                    ));
                }
                SlotVerdict::BudgetDenied { reason } => {
                    // A denial ends the call; the surfaced error is the last
                    // operation error when one exists.
                    let err = Self::terminal_error(last, Some(reason));
                    return Err(self.finish_failure(&state, ctx, breaker.as_deref(), err));
                }
                SlotVerdict::Failure { outcome, err } => {
                    let retryable = outcome.kind == OutcomeKind::Retryable;
                    let backoff_override = outcome.backoff_override;
                    last = Some((outcome, err));

                    if !retryable || slot + 1 >= policy.retry.max_attempts {
                        let err = Self::terminal_error(last, None);
                        return Err(self.finish_failure(&state, ctx, breaker.as_deref(), err));
                    }

                    // Step 6d: backoff sleep, cancellable via context.
                    let sleep = backoff_override
                        .filter(|d| !d.is_zero())
                        .unwrap_or_else(|| policy.retry.jitter.apply(backoff))
                        .min(policy.retry.max_backoff);
                    state.set_last_backoff(sleep);

                    tokio::select! {
                        biased;
                        _ = call_ctx.done() => {
                            let ctx_err = call_ctx.err().unwrap_or(CtxError::Canceled);
                            return Err(self.finish_failure(
                                &state,
                                ctx,
                                breaker.as_deref(),
                                Self::ctx_exec_error(ctx_err),
                            ));
                        }
                        _ = self.sleeper.sleep(sleep) => {}
                    }

                    backoff = backoff
                        .mul_f64(policy.retry.backoff_multiplier)
                        .min(policy.retry.max_backoff);
                }
            }
        }

        unreachable!("retry loop returns from its final slot")
    }

    async fn resolve_policy(&self, key: &PolicyKey) -> Result<EffectivePolicy, ExecError<E>> {
        let resolved = if self.recover_panics {
            match AssertUnwindSafe(self.provider.effective_policy(key))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => {
                    return Err(ExecError::Panic(PanicError {
                        component: "provider",
                        key: key.clone(),
                        message: panic_message(payload.as_ref()),
                    }));
                }
            }
        } else {
            self.provider.effective_policy(key).await
        };

        let policy = match resolved {
            Ok(policy) => policy,
            Err(err) => match self.missing_policy {
                MissingPolicyMode::Deny => {
                    return Err(ExecError::NoPolicy { key: key.clone(), source: err });
                }
                MissingPolicyMode::Allow => EffectivePolicy::minimal(key),
                MissingPolicyMode::Fallback => match err {
                    PolicyError::NotFound => EffectivePolicy::default_for(key),
                    other => {
                        return Err(ExecError::NoPolicy { key: key.clone(), source: other });
                    }
                },
            },
        };
        Ok(policy.normalize())
    }

    fn resolve_classifier(
        &self,
        state: &CallState,
        policy: &EffectivePolicy,
    ) -> Result<Arc<dyn Classify<E>>, ExecError<E>> {
        let name = policy.retry.classifier.trim();
        if name.is_empty() {
            return Ok(self.default_classifier.clone());
        }
        if let Some(classifier) = self.classifiers.get(name) {
            return Ok(classifier);
        }
        match self.missing_classifier {
            MissingClassifierMode::Fallback => {
                tracing::warn!(key = %state.key, classifier = name, "classifier not found, using default");
                state.push_attribute("classifier_not_found", "true");
                state.push_attribute("classifier_name", name);
                state.push_attribute("classifier_fallback", "default");
                Ok(self.default_classifier.clone())
            }
            MissingClassifierMode::Deny => {
                Err(ExecError::NoClassifier { name: name.to_string() })
            }
        }
    }

    fn bind_budget(&self, policy: &EffectivePolicy) -> BudgetBinding {
        let name = policy.retry.budget.name.trim();
        if name.is_empty() {
            return BudgetBinding::None;
        }
        match self.budgets.get(name) {
            Some(budget) => BudgetBinding::Bound(budget),
            None => BudgetBinding::Missing {
                allow_unsafe: self.missing_budget == MissingBudgetMode::AllowUnsafe,
            },
        }
    }

    /// The one place context, operation, and reason errors are reconciled.
    ///
    /// Preference: the last attempt's context error (it is the caller's
    /// context error whenever the caller's context is done), then the last
    /// operation error, then a reason-synthesized error.
    fn terminal_error(
        last: Option<(Outcome, Option<AttemptError<E>>)>,
        denial_reason: Option<String>,
    ) -> ExecError<E> {
        match last {
            Some((_, Some(AttemptError::Canceled))) => ExecError::Canceled,
            Some((_, Some(AttemptError::DeadlineExceeded))) => ExecError::DeadlineExceeded,
            Some((_, Some(AttemptError::Inner(err)))) => ExecError::Inner(err),
            Some((_, Some(AttemptError::Panicked(panic)))) => ExecError::Panic(panic),
            Some((outcome, None)) => ExecError::Aborted { reason: outcome.reason },
            None => ExecError::Aborted {
                reason: denial_reason
                    .unwrap_or_else(|| crate::classifier::reason::ABORT.to_string()),
            },
        }
    }

    fn ctx_exec_error(err: CtxError) -> ExecError<E> {
        match err {
            CtxError::Canceled => ExecError::Canceled,
            CtxError::DeadlineExceeded => ExecError::DeadlineExceeded,
        }
    }

    /// Shared terminal-failure path: breaker record, timeline finalization,
    /// observer notification, capture publication.
    fn finish_failure(
        &self,
        state: &CallState,
        ctx: &CallContext,
        breaker: Option<&CircuitBreaker>,
        err: ExecError<E>,
    ) -> ExecError<E> {
        if let Some(breaker) = breaker {
            breaker.record_failure();
        }
        let timeline = state.finalize(self.clock.now_millis(), Some(err.to_string()));
        self.observer.on_failure(&state.key, &timeline);
        self.publish(ctx, timeline);
        err
    }

    fn publish(&self, ctx: &CallContext, timeline: Timeline) {
        if let Some(capture) = ctx.capture() {
            capture.publish(timeline);
        }
    }

    /// Failure before a policy (and thus a call state) existed.
    fn publish_early_failure(
        &self,
        ctx: &CallContext,
        key: &PolicyKey,
        start_ms: u64,
        err: &ExecError<E>,
    ) {
        if let Some(capture) = ctx.capture() {
            capture.publish(Timeline {
                key: key.clone(),
                policy_id: String::new(),
                start_ms,
                end_ms: self.clock.now_millis(),
                attributes: Vec::new(),
                attempts: Vec::new(),
                final_error: Some(err.to_string()),
            });
        }
    }
}
