//! External cancellation tests.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use convoy::core::TaskState;
use convoy::orchestration::Phase;
use convoy::Error;

use crate::fixtures::{coordinator_with, test_task, ScriptedSpawner, Step};

fn cancel_after(token: &CancellationToken, after: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        token.cancel();
    });
}

/// Test: Cancel with work in flight
/// Given A succeeds quickly, B hangs, and C depends on B
/// When the run is cancelled while B is running
/// Then A is Succeeded, B is Canceled, C never starts and stays Pending
#[tokio::test(start_paused = true)]
async fn test_cancel_drains_in_flight() {
    let spawner = ScriptedSpawner::new()
        .script("b", vec![Step::Hang])
        .into_arc();
    let tasks = vec![
        test_task("a"),
        test_task("b").with_max_retries(3),
        test_task("c").depends_on("b"),
    ];
    let mut coordinator = coordinator_with(2, spawner.clone(), &tasks);
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(5));

    coordinator.execute(&cancel).await.unwrap();

    assert_eq!(coordinator.phase(), Phase::Done);
    assert_eq!(coordinator.task_state(&"a".into()), Some(&TaskState::Succeeded));
    assert_eq!(coordinator.task_state(&"b".into()), Some(&TaskState::Canceled));
    assert_eq!(coordinator.task_state(&"c".into()), Some(&TaskState::Pending));
    assert_eq!(spawner.calls("b"), 1, "cancelled attempts are not retried");
    assert_eq!(spawner.calls("c"), 0);

    let metrics = coordinator.metrics();
    assert_eq!(metrics.success_count, 1);
    assert_eq!(metrics.canceled_count, 1);
    assert_eq!(metrics.not_started_count, 1);
    assert_eq!(metrics.accounted(), metrics.total_agents);
}

/// Test: Cancel before anything completes
/// Given a single hanging task and a queued one behind a ceiling of 1
/// When the run is cancelled
/// Then execute reports Canceled and the queued task never starts
#[tokio::test(start_paused = true)]
async fn test_cancel_before_first_completion() {
    let spawner = ScriptedSpawner::new()
        .with_default(Step::Hang)
        .into_arc();
    let tasks = vec![test_task("a"), test_task("b")];
    let mut coordinator = coordinator_with(1, spawner.clone(), &tasks);
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(1));

    let result = coordinator.execute(&cancel).await;

    assert!(matches!(result, Err(Error::Canceled)));
    assert_eq!(coordinator.task_state(&"a".into()), Some(&TaskState::Canceled));
    assert_eq!(coordinator.task_state(&"b".into()), Some(&TaskState::Pending));
    assert_eq!(spawner.calls("b"), 0);
}

/// Test: Cancelled callbacks
/// Given observers on both success and failure
/// When an in-flight task is cancelled
/// Then neither observer hears about it
#[tokio::test(start_paused = true)]
async fn test_cancel_notifies_no_observer() {
    let spawner = ScriptedSpawner::new()
        .with_default(Step::Hang)
        .into_arc();
    let mut coordinator = coordinator_with(1, spawner, &[test_task("a")]);
    let heard = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    for _ in 0..2 {
        let heard = heard.clone();
        coordinator.on_failure(move |_| {
            heard.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
    }
    let counter = heard.clone();
    coordinator.on_success(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    });
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(500));

    let _ = coordinator.execute(&cancel).await;

    assert_eq!(heard.load(std::sync::atomic::Ordering::SeqCst), 0);
}

/// Test: Parent token cancellation reaches the run
#[tokio::test(start_paused = true)]
async fn test_parent_token_cancels_run() {
    let spawner = ScriptedSpawner::new()
        .script("a", vec![Step::Hang])
        .into_arc();
    let mut coordinator = coordinator_with(1, spawner, &[test_task("a")]);
    let parent = CancellationToken::new();
    let child = parent.child_token();
    cancel_after(&parent, Duration::from_secs(2));

    let result = coordinator.execute(&child).await;

    assert!(matches!(result, Err(Error::Canceled)));
    assert_eq!(coordinator.phase(), Phase::Done);
}

/// Test: Run token is scoped to the run
/// When a run finishes normally
/// Then the caller's token is left untouched
#[tokio::test(start_paused = true)]
async fn test_run_does_not_cancel_caller_token() {
    let spawner = ScriptedSpawner::new().into_arc();
    let mut coordinator = coordinator_with(1, spawner, &[test_task("a")]);
    let cancel = CancellationToken::new();

    coordinator.execute(&cancel).await.unwrap();

    assert!(!cancel.is_cancelled());
}
