//! Integration tests for circuit breaker state transitions.

mod common;

use common::TestClock;
use service_guard::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Metrics};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn breaker(threshold: u32, cool_down: Duration, clock: &TestClock) -> CircuitBreaker {
    CircuitBreaker::with_clock(
        "inventory",
        CircuitBreakerConfig::new(threshold, cool_down).unwrap(),
        clock.shared(),
    )
}

fn fail(breaker: &CircuitBreaker) {
    let result: Result<(), _> = breaker.call(|| Err::<(), _>("unavailable"));
    assert!(matches!(result, Err(CircuitBreakerError::Dependency("unavailable"))));
}

#[tokio::test]
async fn test_full_cycle_with_threshold_three() {
    let clock = TestClock::new();
    let breaker = breaker(3, Duration::from_secs(10), &clock);
    let invocations = AtomicUsize::new(0);

    for _ in 0..3 {
        let result = breaker
            .execute(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker
        .execute(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .await;
    assert!(rejected.unwrap_err().is_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(10));
    let trial = breaker
        .execute(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>("recovered")
        })
        .await;
    assert_eq!(trial.unwrap(), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[test]
fn test_cool_down_timeline() {
    let clock = TestClock::new();
    let breaker = breaker(2, Duration::from_secs(5), &clock);

    fail(&breaker);
    clock.advance(Duration::from_secs(1));
    fail(&breaker);
    assert_eq!(breaker.state(), CircuitState::Open);

    // t = 3s: two seconds into a five second cool-down
    clock.advance(Duration::from_secs(2));
    let err = breaker.call(|| Ok::<_, &str>(())).unwrap_err();
    match err {
        CircuitBreakerError::Open(open) => assert_eq!(open.retry_after, Duration::from_secs(3)),
        other => panic!("expected open circuit, got {other:?}"),
    }

    // t = 6s: the trial runs
    clock.advance(Duration::from_secs(3));
    let mut ran = false;
    breaker
        .call(|| {
            ran = true;
            Ok::<_, &str>(())
        })
        .unwrap();
    assert!(ran);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_failed_trial_restarts_cool_down() {
    let clock = TestClock::new();
    let breaker = breaker(1, Duration::from_secs(5), &clock);

    fail(&breaker);
    clock.advance(Duration::from_secs(5));
    fail(&breaker);
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(4));
    assert!(breaker.call(|| Ok::<_, &str>(())).unwrap_err().is_open());

    clock.advance(Duration::from_secs(1));
    assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
}

#[test]
fn test_success_resets_consecutive_failures() {
    let clock = TestClock::new();
    let breaker = breaker(3, Duration::from_secs(5), &clock);

    fail(&breaker);
    fail(&breaker);
    breaker.call(|| Ok::<_, &str>(())).unwrap();
    fail(&breaker);
    fail(&breaker);

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 2);
}

#[test]
fn test_single_trial_among_concurrent_callers() {
    let clock = TestClock::new();
    let breaker = Arc::new(breaker(1, Duration::from_secs(1), &clock));
    fail(&breaker);
    clock.advance(Duration::from_secs(1));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let release = Arc::new(Barrier::new(2));
    let invocations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            let barrier = Arc::clone(&barrier);
            let release = Arc::clone(&release);
            let invocations = Arc::clone(&invocations);
            thread::spawn(move || {
                barrier.wait();
                breaker.call(|| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    // Hold the trial open until the main thread has seen the others fail
                    release.wait();
                    Ok::<_, &str>(())
                })
            })
        })
        .collect();

    // Everyone except the trial caller returns immediately
    let mut results = Vec::new();
    let mut pending = handles;
    while pending.len() > 1 {
        let (done, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
        results.extend(done.into_iter().map(|h| h.join().unwrap()));
        pending = rest;
        thread::yield_now();
    }
    release.wait();
    results.extend(pending.into_iter().map(|h| h.join().unwrap()));

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(CircuitBreakerError::is_open));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_trips_and_short_circuits_are_counted() {
    let clock = TestClock::new();
    let metrics = Metrics::new();
    let breaker = breaker(1, Duration::from_secs(5), &clock).with_metrics(metrics.clone());

    fail(&breaker);
    let _ = breaker.call(|| Ok::<_, &str>(()));
    let _ = breaker.call(|| Ok::<_, &str>(()));

    assert_eq!(metrics.circuit_trips(), 1);
    assert_eq!(metrics.calls_short_circuited(), 2);
}

#[cfg(feature = "async")]
#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let clock = TestClock::new();
    let breaker = breaker(1, Duration::from_secs(5), &clock);

    let result = breaker
        .execute_with_timeout(Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, &str>(())
        })
        .await;

    assert!(matches!(result, Err(CircuitBreakerError::Timeout(_))));
    assert_eq!(breaker.state(), CircuitState::Open);
}
