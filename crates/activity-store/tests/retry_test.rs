//! Tests for the transient-fault retry policy

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use activity_store::prelude::*;
use tokio_util::sync::CancellationToken;

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

// ==================== Success & Classification ====================

#[tokio::test]
async fn first_attempt_success_does_not_retry() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result = fast_policy(5)
        .execute(&CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StoreError>(42)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result = fast_policy(5)
        .execute(&CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::connection("connection reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fatal_failures_propagate_immediately() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<i32> = fast_policy(5)
        .execute(&CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::schema("relation does not exist"))
            }
        })
        .await;

    assert!(matches!(result, Err(StoreError::Schema { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

// ==================== Exhaustion Boundary ====================

#[tokio::test]
async fn one_fewer_failure_than_the_budget_still_succeeds() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result = fast_policy(4)
        .execute(&CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(StoreError::Deadlock)
                } else {
                    Ok("applied")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "applied");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn exhaustion_returns_the_last_transient_fault_unchanged() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<()> = fast_policy(3)
        .execute(&CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(StoreError::Unavailable {
                    code: "53300".into(),
                    message: format!("throttled on attempt {n}"),
                })
            }
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match result.unwrap_err() {
        StoreError::Unavailable { message, .. } => {
            assert_eq!(message, "throttled on attempt 3");
        }
        other => panic!("expected the final transient fault, got {other}"),
    }
}

// ==================== Cancellation ====================

#[tokio::test]
async fn cancellation_before_the_first_attempt_runs_nothing() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result: Result<()> = fast_policy(5)
        .execute(&cancel, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_interrupts_the_backoff_wait() {
    let policy = RetryPolicy::new()
        .with_max_retries(3)
        .with_base_delay(Duration::from_secs(30))
        .with_max_delay(Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result: Result<()> = policy
        .execute(&cancel, || async {
            Err(StoreError::timeout("statement timed out"))
        })
        .await;

    // cancellation, not exhaustion, and well before the 30s backoff elapses
    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancellation_raised_by_the_operation_is_not_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let result: Result<()> = fast_policy(5)
        .execute(&CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Cancelled)
            }
        })
        .await;

    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
