//! End-to-end scheduling behavior: client, scheduler, and in-process
//! workers wired over duplex channels.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foreman::client::JobSpec;
use foreman::protocol::{JobFailure, KIND_DEPENDENCY_FAILED, KIND_WORKER_TERMINATED};
use foreman::scheduler::JobState;

use harness::{start, start_with_registry, start_with_spawner, wait_for_state, CrashSpawner};

#[tokio::test]
async fn single_job_runs_and_resolves_its_future() {
    let mut rig = start(1).await;

    let handle = rig
        .client
        .submit(JobSpec::call("echo").args(&42u32).unwrap())
        .await
        .unwrap();
    let id = handle.id();

    let seen = wait_for_state(&mut rig.events, id, JobState::Complete).await;
    assert!(seen.contains(&(id, JobState::Active)));

    let value: u32 = handle.result_as().await.unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn dependent_job_blocks_until_its_dependency_completes() {
    let mut rig = start(2).await;

    let a = rig
        .client
        .submit(JobSpec::call("sleep_ms").args(&100u64).unwrap())
        .await
        .unwrap();
    let b = rig
        .client
        .submit(JobSpec::call("echo").args(&1u8).unwrap().after(&a))
        .await
        .unwrap();

    let seen = wait_for_state(&mut rig.events, b.id(), JobState::Complete).await;

    // B was blocked at least once, and never active before A completed.
    assert!(seen.contains(&(b.id(), JobState::Blocked)));
    let a_done = seen
        .iter()
        .position(|e| *e == (a.id(), JobState::Complete))
        .expect("A completed");
    let b_active = seen
        .iter()
        .position(|e| *e == (b.id(), JobState::Active))
        .expect("B ran");
    assert!(a_done < b_active, "B started before its dependency finished");

    b.result().await.unwrap();
}

#[tokio::test]
async fn failing_job_rejects_its_future_with_the_remote_error() {
    let rig = start(1).await;

    let args = ("ValueError".to_string(), "boom".to_string());
    let handle = rig
        .client
        .submit(JobSpec::call("fail").args(&args).unwrap())
        .await
        .unwrap();

    let failure = handle.result().await.unwrap_err();
    assert_eq!(failure.kind, "ValueError");
    assert_eq!(failure.message, "boom");
}

#[tokio::test]
async fn dependency_failure_skips_the_job_without_spawning_a_worker() {
    let mut rig = start(2).await;

    let args = ("ValueError".to_string(), "boom".to_string());
    let a = rig
        .client
        .submit(JobSpec::call("fail").args(&args).unwrap())
        .await
        .unwrap();
    let b = rig
        .client
        .submit(JobSpec::call("echo").args(&1u8).unwrap().after(&a))
        .await
        .unwrap();

    let seen = wait_for_state(&mut rig.events, b.id(), JobState::DependencyFailed).await;
    assert!(
        !seen.contains(&(b.id(), JobState::Active)),
        "a dependency-failed job must never get a worker"
    );

    let b_id = b.id();
    let failure = b.result().await.unwrap_err();
    assert_eq!(failure.kind, KIND_DEPENDENCY_FAILED);
    assert!(failure.message.contains(&a.id().to_string()));

    // Both failures were notified, stickily.
    let notifications = rig.notifications.lock().unwrap();
    assert!(notifications.iter().any(|(id, n)| *id == b_id && n.sticky));
}

#[tokio::test]
async fn concurrency_cap_serializes_activation_in_submission_order() {
    let mut rig = start(4).await;
    // Exercise the config message rather than the construction-time cap.
    rig.client.configure(1).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let handle = rig
            .client
            .submit(JobSpec::call("sleep_ms").args(&30u64).unwrap())
            .await
            .unwrap();
        handles.push(handle);
    }
    let last = handles.last().unwrap().id();
    let seen = wait_for_state(&mut rig.events, last, JobState::Complete).await;

    let activations: Vec<_> = seen
        .iter()
        .filter(|(_, to)| *to == JobState::Active)
        .map(|(id, _)| *id)
        .collect();
    let submitted: Vec<_> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(
        activations, submitted,
        "activation must follow submission order"
    );

    // Never more than one active at a time.
    let mut active = 0usize;
    for (id, to) in &seen {
        match to {
            JobState::Active => {
                active += 1;
                assert!(active <= 1, "cap of one exceeded");
            }
            JobState::Complete | JobState::Failed if activations.contains(id) => {
                active = active.saturating_sub(1);
            }
            _ => {}
        }
    }

    for handle in handles {
        handle.result().await.unwrap();
    }
}

#[tokio::test]
async fn retry_recovers_the_job_and_its_dependency_failed_dependents() {
    let mut registry = harness::test_registry();
    let attempts = Arc::new(AtomicUsize::new(0));
    let flaky_attempts = attempts.clone();
    registry.register_fn("flaky", move |_ctx, _args| {
        let attempts = flaky_attempts.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobFailure::new("ValueError", "first attempt fails"))
            } else {
                Ok(Vec::new())
            }
        }
    });

    let mut rig = start_with_registry(2, Arc::new(registry)).await;

    let a = rig.client.submit(JobSpec::call("flaky")).await.unwrap();
    let b = rig
        .client
        .submit(JobSpec::call("echo").args(&7u8).unwrap().after(&a))
        .await
        .unwrap();

    wait_for_state(&mut rig.events, b.id(), JobState::DependencyFailed).await;

    // The presentation layer asks for another attempt.
    rig.handle.retry(a.id()).await.unwrap();

    let seen = wait_for_state(&mut rig.events, b.id(), JobState::Complete).await;
    assert!(seen.contains(&(a.id(), JobState::Inited)), "A reset by retry");
    assert!(seen.contains(&(b.id(), JobState::Inited)), "B reset by cascade");
    assert!(seen.contains(&(a.id(), JobState::Complete)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_of_a_non_failed_job_is_ignored() {
    let mut rig = start(1).await;

    let handle = rig
        .client
        .submit(JobSpec::call("echo").args(&1u8).unwrap())
        .await
        .unwrap();
    let id = handle.id();
    wait_for_state(&mut rig.events, id, JobState::Complete).await;

    rig.handle.retry(id).await.unwrap();
    handle.result().await.unwrap();

    // Still complete; no reset event arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(foreman::scheduler::SchedulerEvent::StateChanged { to, .. }) = rig.events.try_recv() {
        panic!("unexpected state change to {to}");
    }
}

#[tokio::test]
async fn worker_eof_without_terminal_message_fails_the_job() {
    let mut rig = start_with_spawner(1, CrashSpawner).await;

    let handle = rig.client.submit(JobSpec::call("anything")).await.unwrap();
    let id = handle.id();

    wait_for_state(&mut rig.events, id, JobState::Failed).await;
    let failure = handle.result().await.unwrap_err();
    assert_eq!(failure.kind, KIND_WORKER_TERMINATED);
    assert!(failure.message.contains("worker terminated unexpectedly"));
}

#[tokio::test]
async fn scheduler_drains_and_exits_after_client_shutdown() {
    let rig = start(2).await;

    let handle = rig
        .client
        .submit(JobSpec::call("echo").args(&5u8).unwrap())
        .await
        .unwrap();
    handle.result().await.unwrap();

    rig.client.shutdown().await.unwrap();
    drop(rig.handle);

    let result = tokio::time::timeout(Duration::from_secs(5), rig.scheduler)
        .await
        .expect("scheduler did not exit")
        .expect("scheduler task panicked");
    result.expect("scheduler exited with an error");
}
