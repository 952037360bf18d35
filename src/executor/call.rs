//! Per-call machinery: attempt execution and the hedged retry-slot group.
//!
//! One retry slot runs a primary attempt plus up to `max_hedges` speculative
//! siblings. All attempts of a slot are driven through a `FuturesUnordered`
//! inside the call future itself, so dropping the group cancels every
//! in-flight attempt and no detached tasks outlive the call.

use super::{BudgetBinding, Executor};
use crate::budget::{self, AttemptKind, BudgetRequest, Release, ReleaseGuard};
use crate::classifier::{self, Classify, Outcome};
use crate::context::{AttemptContext, CallContext, CtxError};
use crate::error::{AttemptError, PanicError};
use crate::hedge::{FixedDelayTrigger, HedgeState, HedgeTrigger};
use crate::latency::RingBufferTracker;
use crate::observe::{AttemptInfo, AttemptRecord, BudgetEvent, Timeline, PEER_WON};
use crate::policy::{EffectivePolicy, PolicyKey};
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Mutable state shared by every attempt of one call.
pub(crate) struct CallState {
    pub(crate) key: PolicyKey,
    pub(crate) policy_id: String,
    pub(crate) start_ms: u64,
    pub(crate) tracker: Arc<RingBufferTracker>,
    attributes: Mutex<Vec<(String, String)>>,
    attempts: Mutex<Vec<AttemptRecord>>,
    attempt_seq: AtomicU32,
}

impl CallState {
    pub(crate) fn new(
        key: PolicyKey,
        policy_id: String,
        start_ms: u64,
        tracker: Arc<RingBufferTracker>,
    ) -> Self {
        Self {
            key,
            policy_id,
            start_ms,
            tracker,
            attributes: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            attempt_seq: AtomicU32::new(0),
        }
    }

    pub(crate) fn push_attribute(&self, key: &str, value: impl Into<String>) {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key.to_string(), value.into()));
    }

    fn push_record(&self, record: AttemptRecord) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Stamp the backoff scheduled after the slot whose attempt completed
    /// last. Called before the timeline is finalized, never after.
    pub(crate) fn set_last_backoff(&self, backoff: Duration) {
        if let Some(last) = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_mut()
        {
            last.backoff = backoff;
        }
    }

    fn next_ordinal(&self) -> u32 {
        self.attempt_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Assemble the finalized timeline. The single call site per execution is
    /// what makes `End`/`FinalErr` single-assignment.
    pub(crate) fn finalize(&self, end_ms: u64, final_error: Option<String>) -> Timeline {
        Timeline {
            key: self.key.clone(),
            policy_id: self.policy_id.clone(),
            start_ms: self.start_ms,
            end_ms,
            attributes: self
                .attributes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            attempts: self
                .attempts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            final_error,
        }
    }
}

/// What one finished attempt reports back to the slot.
pub(crate) struct AttemptOutput<T, E> {
    pub(crate) hedge_index: u32,
    pub(crate) budget_allowed: bool,
    pub(crate) budget_reason: String,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) value: Option<T>,
    pub(crate) err: Option<AttemptError<E>>,
}

/// A slot's aggregate result, driving the retry decision.
pub(crate) enum SlotVerdict<T, E> {
    Success(T),
    Failure {
        outcome: Outcome,
        err: Option<AttemptError<E>>,
    },
    BudgetDenied {
        reason: String,
    },
    CtxDone,
}

/// How the budget gate resolved for one attempt.
enum BudgetGate {
    Allowed { reason: String, release: Option<Release> },
    Denied { reason: String },
    /// The budget itself panicked; the attempt aborts with a typed error.
    Panicked(PanicError),
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl<E> Executor<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Run one retry slot to its aggregate verdict.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_slot<T, F, Fut>(
        &self,
        state: &CallState,
        call_ctx: &CallContext,
        op: &F,
        policy: &EffectivePolicy,
        classifier: &Arc<dyn Classify<E>>,
        budget: &BudgetBinding,
        hedging_active: bool,
        slot: u32,
    ) -> SlotVerdict<T, E>
    where
        T: Send,
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        if !hedging_active {
            let info = self.attempt_info(state, slot, 0);
            let out = self
                .run_attempt(state, call_ctx.clone(), op, policy, classifier, budget, info)
                .await;
            return verdict_from(out);
        }
        self.run_hedged_slot(state, call_ctx, op, policy, classifier, budget, slot)
            .await
    }

    /// The full concurrent group: primary, hedge scheduler, result collection.
    #[allow(clippy::too_many_arguments)]
    async fn run_hedged_slot<T, F, Fut>(
        &self,
        state: &CallState,
        call_ctx: &CallContext,
        op: &F,
        policy: &EffectivePolicy,
        classifier: &Arc<dyn Classify<E>>,
        budget: &BudgetBinding,
        slot: u32,
    ) -> SlotVerdict<T, E>
    where
        T: Send,
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let group = call_ctx.child();
        let max_hedges = policy.hedge.max_hedges;
        let trigger: Arc<dyn HedgeTrigger> = match self.triggers.get(&policy.hedge.trigger) {
            Some(trigger) => trigger,
            None => Arc::new(FixedDelayTrigger::new(policy.hedge.hedge_delay)),
        };

        let slot_started = Instant::now();
        let attempt_start_ms = self.clock.now_millis();

        let mut inflight: FuturesUnordered<
            Pin<Box<dyn Future<Output = AttemptOutput<T, E>> + Send + '_>>,
        > = FuturesUnordered::new();

        let primary = self.attempt_info(state, slot, 0);
        let mut live: Vec<AttemptInfo> = vec![primary.clone()];
        inflight.push(Box::pin(self.run_attempt(
            state,
            group.clone(),
            op,
            policy,
            classifier,
            budget,
            primary,
        )));
        let mut launched: u32 = 1;

        // Last completion wins the retry decision when nobody succeeds.
        let mut last_failure: Option<(Outcome, Option<AttemptError<E>>)> = None;
        let mut last_was_denial: Option<String> = None;
        let mut next_poll = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = call_ctx.done() => {
                    group.cancel();
                    drop(inflight);
                    let reason = match call_ctx.err() {
                        Some(CtxError::DeadlineExceeded) => {
                            classifier::reason::CONTEXT_DEADLINE_EXCEEDED
                        }
                        _ => classifier::reason::CONTEXT_CANCELED,
                    };
                    self.abort_live(state, &live, attempt_start_ms, reason);
                    return SlotVerdict::CtxDone;
                }
                Some(out) = inflight.next() => {
                    live.retain(|info| info.hedge_index != out.hedge_index);

                    if let Some(value) = out.value {
                        group.cancel();
                        drop(inflight);
                        self.abort_live(state, &live, attempt_start_ms, PEER_WON);
                        return SlotVerdict::Success(value);
                    }

                    if let Some(outcome) = out.outcome {
                        let terminal = outcome.kind.is_terminal();
                        last_failure = Some((outcome, out.err));
                        last_was_denial = None;
                        if terminal && policy.hedge.cancel_on_first_terminal {
                            group.cancel();
                            drop(inflight);
                            self.abort_live(state, &live, attempt_start_ms, PEER_WON);
                            let (outcome, err) = last_failure.take()
                                .unwrap_or_else(|| unreachable!("terminal failure was just stored"));
                            return SlotVerdict::Failure { outcome, err };
                        }
                    } else if !out.budget_allowed {
                        last_was_denial = Some(out.budget_reason);
                    }

                    if inflight.is_empty() {
                        // Everything launched has completed without success;
                        // leave the slot with the last result.
                        return match (last_was_denial, last_failure) {
                            (Some(reason), _) => SlotVerdict::BudgetDenied { reason },
                            (None, Some((outcome, err))) => SlotVerdict::Failure { outcome, err },
                            (None, None) => SlotVerdict::BudgetDenied {
                                reason: budget::reason::BUDGET_DENIED.to_string(),
                            },
                        };
                    }
                }
                _ = tokio::time::sleep_until(next_poll), if launched < 1 + max_hedges => {
                    let hedge_state = HedgeState {
                        call_start_ms: state.start_ms,
                        attempt_start_ms,
                        attempts_launched: launched,
                        max_hedges,
                        elapsed: slot_started.elapsed(),
                        snapshot: state.tracker.snapshot(),
                        hedge_delay: policy.hedge.hedge_delay,
                    };
                    let decision = trigger.should_spawn(&hedge_state);
                    if decision.spawn && launched < 1 + max_hedges {
                        let info = self.attempt_info(state, slot, launched);
                        live.push(info.clone());
                        inflight.push(Box::pin(self.run_attempt(
                            state,
                            group.clone(),
                            op,
                            policy,
                            classifier,
                            budget,
                            info,
                        )));
                        launched += 1;
                    }
                    let wait = if decision.next_check_in.is_zero() {
                        self.trigger_poll
                    } else {
                        decision.next_check_in
                    };
                    next_poll = Instant::now() + wait;
                }
            }
        }
    }

    /// One attempt, inline: budget gate, context derivation, operation,
    /// classification, record, release.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt<T, F, Fut>(
        &self,
        state: &CallState,
        parent: CallContext,
        op: &F,
        policy: &EffectivePolicy,
        classifier: &Arc<dyn Classify<E>>,
        budget: &BudgetBinding,
        info: AttemptInfo,
    ) -> AttemptOutput<T, E>
    where
        T: Send,
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let slot = info.retry_index;
        let start_ms = self.clock.now_millis();

        let (budget_reason, release) = match self.gate_budget(state, policy, &info, budget) {
            BudgetGate::Allowed { reason, release } => (reason, release),
            BudgetGate::Denied { reason } => {
                let record = AttemptRecord {
                    attempt: slot,
                    start_ms,
                    end_ms: self.clock.now_millis(),
                    is_hedge: info.is_hedge,
                    hedge_index: info.hedge_index,
                    outcome: None,
                    error: None,
                    backoff: Duration::ZERO,
                    budget_allowed: false,
                    budget_reason: reason.clone(),
                };
                state.push_record(record.clone());
                self.observer.on_attempt(&state.key, &record);
                return AttemptOutput {
                    hedge_index: info.hedge_index,
                    budget_allowed: false,
                    budget_reason: reason,
                    outcome: None,
                    value: None,
                    err: None,
                };
            }
            BudgetGate::Panicked(panic) => {
                let outcome = Outcome::abort(budget::reason::PANIC_IN_BUDGET);
                let err = AttemptError::Panicked(panic);
                let record = AttemptRecord {
                    attempt: slot,
                    start_ms,
                    end_ms: self.clock.now_millis(),
                    is_hedge: info.is_hedge,
                    hedge_index: info.hedge_index,
                    outcome: Some(outcome.clone()),
                    error: Some(err.to_string()),
                    backoff: Duration::ZERO,
                    budget_allowed: false,
                    budget_reason: budget::reason::PANIC_IN_BUDGET.to_string(),
                };
                state.push_record(record.clone());
                self.observer.on_attempt(&state.key, &record);
                return AttemptOutput {
                    hedge_index: info.hedge_index,
                    budget_allowed: false,
                    budget_reason: budget::reason::PANIC_IN_BUDGET.to_string(),
                    outcome: Some(outcome),
                    value: None,
                    err: Some(err),
                };
            }
        };
        // Drop-armed: fires at attempt completion, cancellation, or unwind,
        // whichever comes first.
        let mut release = ReleaseGuard::new(release);

        let mut attempt_ctx = parent.child().strip_capture();
        if let Some(timeout) = policy.retry.timeout_per_attempt {
            attempt_ctx = attempt_ctx.with_timeout(timeout);
        }
        let actx = AttemptContext::new(attempt_ctx.clone(), info.clone());

        if info.is_hedge {
            self.observer.on_hedge_spawn(&state.key, &info);
        }

        let result = self.invoke_op(state, &attempt_ctx, op, actx).await;

        let (value, outcome, err) = match result {
            Ok(value) => (Some(value), Outcome::success(), None),
            // A recovered panic is always an abort; classifiers never see it.
            Err(AttemptError::Panicked(panic)) => {
                let outcome = Outcome::abort(format!("panic_in_{}", panic.component));
                (None, outcome, Some(AttemptError::Panicked(panic)))
            }
            Err(attempt_err) => {
                let (outcome, classifier_panic) =
                    self.classify_checked(state, classifier, &attempt_err);
                let err = match classifier_panic {
                    Some(panic) => AttemptError::Panicked(panic),
                    None => attempt_err,
                };
                (None, outcome, Some(err))
            }
        };

        let end_ms = self.clock.now_millis();
        state
            .tracker
            .record(Duration::from_millis(end_ms.saturating_sub(start_ms)));

        let record = AttemptRecord {
            attempt: slot,
            start_ms,
            end_ms,
            is_hedge: info.is_hedge,
            hedge_index: info.hedge_index,
            outcome: Some(outcome.clone()),
            error: err.as_ref().map(ToString::to_string),
            backoff: Duration::ZERO,
            budget_allowed: true,
            budget_reason: budget_reason.clone(),
        };
        state.push_record(record.clone());
        self.observer.on_attempt(&state.key, &record);
        release.fire();

        AttemptOutput {
            hedge_index: info.hedge_index,
            budget_allowed: true,
            budget_reason,
            outcome: Some(outcome),
            value,
            err,
        }
    }

    /// Run the operation raced against its context, with optional panic
    /// recovery.
    async fn invoke_op<T, F, Fut>(
        &self,
        state: &CallState,
        attempt_ctx: &CallContext,
        op: &F,
        actx: AttemptContext,
    ) -> Result<T, AttemptError<E>>
    where
        T: Send,
        F: Fn(AttemptContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let ctx_err = |ctx: &CallContext| match ctx.err() {
            Some(CtxError::DeadlineExceeded) => AttemptError::DeadlineExceeded,
            _ => AttemptError::Canceled,
        };

        if self.recover_panics {
            tokio::select! {
                biased;
                result = AssertUnwindSafe(op(actx)).catch_unwind() => match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(AttemptError::Inner(err)),
                    Err(payload) => Err(AttemptError::Panicked(PanicError {
                        component: "operation",
                        key: state.key.clone(),
                        message: panic_message(payload.as_ref()),
                    })),
                },
                _ = attempt_ctx.done() => Err(ctx_err(attempt_ctx)),
            }
        } else {
            tokio::select! {
                biased;
                result = op(actx) => result.map_err(AttemptError::Inner),
                _ = attempt_ctx.done() => Err(ctx_err(attempt_ctx)),
            }
        }
    }

    /// Classify with boundary sanitization; a classifier panic becomes
    /// `Abort/panic_in_classifier` plus a typed panic error.
    fn classify_checked(
        &self,
        state: &CallState,
        classifier: &Arc<dyn Classify<E>>,
        err: &AttemptError<E>,
    ) -> (Outcome, Option<PanicError>) {
        if self.recover_panics {
            match std::panic::catch_unwind(AssertUnwindSafe(|| classifier.classify(Some(err)))) {
                Ok(outcome) => (outcome.sanitize(), None),
                Err(payload) => {
                    let panic = PanicError {
                        component: "classifier",
                        key: state.key.clone(),
                        message: panic_message(payload.as_ref()),
                    };
                    tracing::error!(key = %state.key, message = %panic.message, "classifier panicked");
                    (
                        Outcome::abort(classifier::reason::PANIC_IN_CLASSIFIER),
                        Some(panic),
                    )
                }
            }
        } else {
            (classifier.classify(Some(err)).sanitize(), None)
        }
    }

    /// Budget gate for one attempt.
    fn gate_budget(
        &self,
        state: &CallState,
        policy: &EffectivePolicy,
        info: &AttemptInfo,
        budget: &BudgetBinding,
    ) -> BudgetGate {
        let kind = if info.is_hedge { AttemptKind::Hedge } else { AttemptKind::Retry };
        let name = policy.retry.budget.name.as_str();

        let gate = match budget {
            BudgetBinding::None => {
                // No budget configured: allowed, and no event emitted.
                return BudgetGate::Allowed {
                    reason: budget::reason::NO_BUDGET.to_string(),
                    release: None,
                };
            }
            BudgetBinding::Missing { allow_unsafe: true } => BudgetGate::Allowed {
                reason: budget::reason::BUDGET_NOT_FOUND.to_string(),
                release: None,
            },
            BudgetBinding::Missing { allow_unsafe: false } => BudgetGate::Denied {
                reason: budget::reason::BUDGET_NOT_FOUND.to_string(),
            },
            BudgetBinding::Bound(bound) => {
                let request = BudgetRequest {
                    key: &state.key,
                    attempt_index: info.retry_index,
                    kind,
                    name,
                    cost: policy.retry.budget.cost,
                };
                let decision = if self.recover_panics {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| {
                        bound.allow_attempt(&request)
                    })) {
                        Ok(decision) => Ok(decision),
                        Err(payload) => {
                            let panic = PanicError {
                                component: "budget",
                                key: state.key.clone(),
                                message: panic_message(payload.as_ref()),
                            };
                            tracing::error!(key = %state.key, message = %panic.message, "budget panicked");
                            Err(panic)
                        }
                    }
                } else {
                    Ok(bound.allow_attempt(&request))
                };
                match decision {
                    Ok(decision) if decision.allowed => BudgetGate::Allowed {
                        reason: decision.reason,
                        release: decision.release,
                    },
                    Ok(decision) => {
                        // Denial-time release runs here, exactly once.
                        if let Some(release) = decision.release {
                            release();
                        }
                        BudgetGate::Denied { reason: decision.reason }
                    }
                    Err(panic) => BudgetGate::Panicked(panic),
                }
            }
        };

        let (allowed, reason) = match &gate {
            BudgetGate::Allowed { reason, .. } => (true, reason.clone()),
            BudgetGate::Denied { reason } => (false, reason.clone()),
            BudgetGate::Panicked(_) => {
                (false, budget::reason::PANIC_IN_BUDGET.to_string())
            }
        };
        let event = BudgetEvent {
            key: state.key.clone(),
            attempt_index: info.retry_index,
            kind,
            name: name.to_string(),
            allowed,
            reason,
        };
        self.observer.on_budget_decision(&event);
        gate
    }

    /// Record and announce attempts that were cancelled before producing a
    /// classified outcome.
    fn abort_live(
        &self,
        state: &CallState,
        live: &[AttemptInfo],
        start_ms: u64,
        reason: &str,
    ) {
        let now = self.clock.now_millis();
        for info in live {
            let record = AttemptRecord {
                attempt: info.retry_index,
                start_ms,
                end_ms: now,
                is_hedge: info.is_hedge,
                hedge_index: info.hedge_index,
                outcome: None,
                error: None,
                backoff: Duration::ZERO,
                budget_allowed: true,
                budget_reason: budget::reason::ALLOWED.to_string(),
            };
            state.push_record(record);
            self.observer.on_hedge_cancel(&state.key, info, reason);
        }
    }

    fn attempt_info(&self, state: &CallState, slot: u32, hedge_index: u32) -> AttemptInfo {
        AttemptInfo {
            retry_index: slot,
            attempt: state.next_ordinal(),
            is_hedge: hedge_index > 0,
            hedge_index,
            policy_id: state.policy_id.clone(),
        }
    }
}

pub(crate) fn verdict_from<T, E>(out: AttemptOutput<T, E>) -> SlotVerdict<T, E> {
    if let Some(value) = out.value {
        return SlotVerdict::Success(value);
    }
    if let Some(outcome) = out.outcome {
        return SlotVerdict::Failure { outcome, err: out.err };
    }
    if !out.budget_allowed {
        return SlotVerdict::BudgetDenied { reason: out.budget_reason };
    }
    SlotVerdict::Failure {
        outcome: Outcome::abort(classifier::reason::UNKNOWN_OUTCOME),
        err: out.err,
    }
}
