//! End-to-end retry flows: backoff sequences, Retry-After overrides, budget
//! denials, and cancellation during backoff.

mod common;

use common::{retry_policy, HttpCallError, TestError};
use palisade::{
    AttemptKind, Budget, BudgetRequest, CallContext, Decision, Executor, HttpClassifier,
    InstantSleeper, PolicyKey, TrackingSleeper,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn three_attempt_retry_observes_exact_backoff_sequence() {
    let key = PolicyKey::parse("svc.op");
    let mut policy = retry_policy(&key, 3, 10, 250);
    policy.retry.max_backoff = Duration::from_millis(250);

    let sleeper = TrackingSleeper::new();
    let executor: Executor<TestError> = Executor::builder()
        .policy("svc.op", policy)
        .with_sleeper(sleeper.clone())
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (ctx, capture) = CallContext::background().record_timeline();

    executor
        .execute(&ctx, &key, move |_actx| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::new("transient"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        sleeper.calls(),
        vec![Duration::from_millis(10), Duration::from_millis(20)],
        "exponential backoff without jitter must be exact"
    );

    let timeline = capture.timeline().expect("captured");
    assert_eq!(timeline.attempts.len(), 3);
    assert!(timeline.final_error.is_none());
    assert_eq!(timeline.attempts[0].backoff, Duration::from_millis(10));
    assert_eq!(timeline.attempts[1].backoff, Duration::from_millis(20));
    assert_eq!(timeline.attempts[2].backoff, Duration::ZERO);
}

#[tokio::test]
async fn retry_after_overrides_computed_backoff() {
    let key = PolicyKey::parse("svc.op");
    let policy = retry_policy(&key, 3, 10, 250);

    let sleeper = TrackingSleeper::new();
    let executor: Executor<HttpCallError> = Executor::builder()
        .policy("svc.op", policy)
        .default_classifier(Arc::new(HttpClassifier::new()))
        .with_sleeper(sleeper.clone())
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (ctx, capture) = CallContext::background().record_timeline();

    let status = executor
        .execute(&ctx, &key, move |_actx| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HttpCallError::status(429, "GET")
                        .with_retry_after(Duration::from_millis(200)))
                } else {
                    Ok(200_u16)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(status, 200);
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(200)]);

    let timeline = capture.timeline().expect("captured");
    let first = &timeline.attempts[0];
    let outcome = first.outcome.as_ref().expect("classified");
    assert_eq!(outcome.backoff_override, Some(Duration::from_millis(200)));
    assert_eq!(outcome.reason, "http_429");
}

#[tokio::test]
async fn retry_after_is_capped_by_max_backoff() {
    let key = PolicyKey::parse("svc.op");
    let policy = retry_policy(&key, 2, 10, 50);

    let sleeper = TrackingSleeper::new();
    let executor: Executor<HttpCallError> = Executor::builder()
        .policy("svc.op", policy)
        .default_classifier(Arc::new(HttpClassifier::new()))
        .with_sleeper(sleeper.clone())
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();

    executor
        .execute(&CallContext::background(), &key, move |_actx| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HttpCallError::status(429, "GET")
                        .with_retry_after(Duration::from_secs(10)))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(sleeper.calls(), vec![Duration::from_millis(50)]);
}

/// Budget that admits the first retry slot and denies the rest.
struct FirstAttemptOnly;

impl Budget for FirstAttemptOnly {
    fn allow_attempt(&self, req: &BudgetRequest<'_>) -> Decision {
        if req.attempt_index == 0 {
            Decision::allow("allowed")
        } else {
            Decision::deny("budget_denied")
        }
    }
}

#[tokio::test]
async fn budget_denial_surfaces_the_first_attempt_error() {
    let key = PolicyKey::parse("svc.op");
    let mut policy = retry_policy(&key, 3, 10, 250);
    policy.retry.budget.name = "strict".to_string();

    let executor: Executor<TestError> = Executor::builder()
        .policy("svc.op", policy)
        .budget("strict", Arc::new(FirstAttemptOnly))
        .unwrap()
        .with_sleeper(InstantSleeper)
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (ctx, capture) = CallContext::background().record_timeline();

    let err = executor
        .execute(&ctx, &key, move |_actx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::new("first-error"))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "denied slot must not run the op");
    assert_eq!(
        err.into_inner().expect("operation error, not a budget string"),
        TestError::new("first-error")
    );

    let timeline = capture.timeline().expect("captured");
    assert_eq!(timeline.attempts.len(), 2);
    let denied = &timeline.attempts[1];
    assert!(!denied.budget_allowed);
    assert_eq!(denied.budget_reason, "budget_denied");
    assert!(denied.error.is_none());
    assert!(denied.outcome.is_none());
}

#[tokio::test]
async fn budget_sees_the_retry_kind_for_slot_primaries() {
    let key = PolicyKey::parse("svc.op");
    let mut policy = retry_policy(&key, 2, 1, 10);
    policy.retry.budget.name = "counting".to_string();

    struct KindRecorder {
        kinds: std::sync::Mutex<Vec<AttemptKind>>,
    }

    impl Budget for KindRecorder {
        fn allow_attempt(&self, req: &BudgetRequest<'_>) -> Decision {
            self.kinds.lock().unwrap().push(req.kind);
            Decision::allow("allowed")
        }
    }

    let recorder = Arc::new(KindRecorder { kinds: std::sync::Mutex::new(Vec::new()) });
    let executor: Executor<TestError> = Executor::builder()
        .policy("svc.op", policy)
        .budget("counting", recorder.clone())
        .unwrap()
        .with_sleeper(InstantSleeper)
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    executor
        .execute(&CallContext::background(), &key, move |_actx| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::new("transient"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    let kinds = recorder.kinds.lock().unwrap();
    assert_eq!(kinds.as_slice(), &[AttemptKind::Retry, AttemptKind::Retry]);
}

#[tokio::test]
async fn cancellation_during_backoff_stops_the_call() {
    let key = PolicyKey::parse("svc.op");
    let policy = retry_policy(&key, 3, 100, 1000);

    // Real sleeper: the cancel must interrupt a genuine 100ms sleep.
    let executor: Executor<TestError> = Executor::builder().policy("svc.op", policy).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let ctx = CallContext::background();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = executor
        .execute(&ctx, &key, move |_actx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::new("transient"))
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_canceled(), "got {err:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no attempt after cancellation");
    assert!(
        started.elapsed() < Duration::from_millis(90),
        "the backoff sleep must be interrupted"
    );
}

#[tokio::test]
async fn timeline_records_policy_attributes() {
    let key = PolicyKey::parse("svc.op");
    let mut policy = retry_policy(&key, 1, 10, 250);
    // Out-of-range on purpose: normalization must clamp and record it.
    policy.retry.max_attempts = 99;

    let executor: Executor<TestError> = Executor::builder().policy("svc.op", policy).build();
    let (ctx, capture) = CallContext::background().record_timeline();

    executor
        .execute(&ctx, &key, |_actx| async { Ok::<_, TestError>(()) })
        .await
        .unwrap();

    let timeline = capture.timeline().expect("captured");
    assert_eq!(timeline.attribute("policy_source"), Some("static"));
    assert_eq!(timeline.attribute("policy_normalized"), Some("true"));
    assert_eq!(
        timeline.attribute("policy_clamped_fields"),
        Some("retry.max_attempts")
    );
}

#[tokio::test]
async fn nested_calls_do_not_inherit_the_capture() {
    let key = PolicyKey::parse("svc.outer");
    let inner_key = PolicyKey::parse("svc.inner");

    let executor: Arc<Executor<TestError>> = Arc::new(
        Executor::builder()
            .policy("svc.outer", retry_policy(&key, 1, 1, 10))
            .policy("svc.inner", retry_policy(&inner_key, 1, 1, 10))
            .build(),
    );

    let (ctx, capture) = CallContext::background().record_timeline();
    let inner_exec = executor.clone();
    let inner_key_for_op = inner_key.clone();

    executor
        .execute(&ctx, &key, move |actx| {
            let inner_exec = inner_exec.clone();
            let inner_key = inner_key_for_op.clone();
            async move {
                // The nested call must not overwrite the outer capture.
                inner_exec
                    .execute(&actx.call_context(), &inner_key, |_actx| async {
                        Ok::<_, TestError>(())
                    })
                    .await
                    .unwrap();
                Ok::<_, TestError>(())
            }
        })
        .await
        .unwrap();

    let timeline = capture.timeline().expect("captured");
    assert_eq!(timeline.key, key, "outer call owns the capture");
}
