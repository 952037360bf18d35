//! Circuit breaker end-to-end: open, short-circuit, probe, close.

mod common;

use common::{retry_policy, TestError};
use palisade::{
    CallContext, CircuitState, EffectivePolicy, ExecError, Executor, InstantSleeper, ManualClock,
    PolicyKey,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn circuit_policy(key: &PolicyKey) -> EffectivePolicy {
    let mut policy = retry_policy(key, 1, 1, 10);
    policy.circuit.enabled = true;
    policy.circuit.threshold = 2;
    policy.circuit.cooldown = Duration::from_millis(100);
    policy.circuit.max_probes = 1;
    policy.circuit.probes_required = 1;
    policy
}

fn build(key: &PolicyKey, clock: ManualClock) -> Executor<TestError> {
    Executor::builder()
        .policy(&key.to_string(), circuit_policy(key))
        .with_clock(Arc::new(clock))
        .with_sleeper(InstantSleeper)
        .build()
}

async fn failing_call(executor: &Executor<TestError>, key: &PolicyKey) -> ExecError<TestError> {
    executor
        .execute(&CallContext::background(), key, |_actx| async {
            Err::<(), _>(TestError::new("downstream down"))
        })
        .await
        .unwrap_err()
}

#[tokio::test]
async fn breaker_opens_then_probes_then_closes() {
    let key = PolicyKey::parse("svc.op");
    let clock = ManualClock::new();
    let executor = build(&key, clock.clone());

    // Two failing calls reach the threshold.
    assert!(failing_call(&executor, &key).await.is_inner());
    assert!(failing_call(&executor, &key).await.is_inner());
    assert_eq!(executor.breaker_state(&key), Some(CircuitState::Open));

    // Third call is short-circuited without invoking the operation.
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let err = executor
        .execute(&CallContext::background(), &key, move |_actx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            }
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // After the cooldown a successful probe closes the circuit.
    clock.advance(Duration::from_millis(101));
    executor
        .execute(&CallContext::background(), &key, |_actx| async {
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();
    assert_eq!(executor.breaker_state(&key), Some(CircuitState::Closed));

    // Subsequent calls run normally.
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    executor
        .execute(&CallContext::background(), &key, move |_actx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            }
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_circuit_produces_no_attempt_records() {
    let key = PolicyKey::parse("svc.op");
    let clock = ManualClock::new();
    let executor = build(&key, clock);

    failing_call(&executor, &key).await;
    failing_call(&executor, &key).await;

    let (ctx, capture) = CallContext::background().record_timeline();
    let err = executor
        .execute(&ctx, &key, |_actx| async { Ok::<_, TestError>(()) })
        .await
        .unwrap_err();

    match err {
        ExecError::CircuitOpen { state, reason } => {
            assert_eq!(state, CircuitState::Open);
            assert_eq!(reason, "circuit_open");
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    let timeline = capture.timeline().expect("captured");
    assert!(timeline.attempts.is_empty(), "no attempts while open");
    assert_eq!(timeline.attribute("circuit_state"), Some("open"));
    assert!(timeline.final_error.is_some());
}

#[tokio::test]
async fn failed_probe_reopens_the_circuit() {
    let key = PolicyKey::parse("svc.op");
    let clock = ManualClock::new();
    let executor = build(&key, clock.clone());

    failing_call(&executor, &key).await;
    failing_call(&executor, &key).await;
    clock.advance(Duration::from_millis(101));

    // Probe fails: straight back to open.
    assert!(failing_call(&executor, &key).await.is_inner());
    assert_eq!(executor.breaker_state(&key), Some(CircuitState::Open));
    assert!(failing_call(&executor, &key).await.is_circuit_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn half_open_limits_concurrent_probes() {
    let key = PolicyKey::parse("svc.op");
    let clock = ManualClock::new();
    let executor = Arc::new(build(&key, clock.clone()));

    failing_call(&executor, &key).await;
    failing_call(&executor, &key).await;
    clock.advance(Duration::from_millis(101));

    // First probe holds the only slot for a while.
    let probe_exec = executor.clone();
    let probe_key = key.clone();
    let probe = tokio::spawn(async move {
        probe_exec
            .execute(&CallContext::background(), &probe_key, |_actx| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, TestError>(())
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = executor
        .execute(&CallContext::background(), &key, |_actx| async {
            Ok::<_, TestError>(())
        })
        .await
        .unwrap_err();
    match err {
        ExecError::CircuitOpen { state, reason } => {
            assert_eq!(state, CircuitState::HalfOpen);
            assert_eq!(reason, "circuit_half_open_probe_limit");
        }
        other => panic!("expected probe-limit rejection, got {other:?}"),
    }

    probe.await.unwrap().unwrap();
    assert_eq!(executor.breaker_state(&key), Some(CircuitState::Closed));
}

#[tokio::test]
async fn reset_breaker_restores_service() {
    let key = PolicyKey::parse("svc.op");
    let clock = ManualClock::new();
    let executor = build(&key, clock);

    failing_call(&executor, &key).await;
    failing_call(&executor, &key).await;
    assert!(failing_call(&executor, &key).await.is_circuit_open());

    assert!(executor.reset_breaker(&key));
    executor
        .execute(&CallContext::background(), &key, |_actx| async {
            Ok::<_, TestError>(())
        })
        .await
        .unwrap();
}
