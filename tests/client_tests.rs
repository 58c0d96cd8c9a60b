//! Client-side contract: future settlement, host-shutdown rejection, and
//! the progress/notification side channels.


use std::time::Duration;

use foreman::client::{Client, JobSpec};
use foreman::scheduler::JobState;

use harness::{start, wait_for_state};

#[tokio::test]
async fn pending_futures_reject_when_the_host_channel_disappears() {
    let (client_io, host_io) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(client_io);
    let client = Client::over_stream(reader, writer);

    let a = client.submit(JobSpec::call("never_runs")).await.unwrap();
    let b = client.submit(JobSpec::call("never_runs")).await.unwrap();

    // The host dies before answering anything.
    drop(host_io);

    let fa = tokio::time::timeout(Duration::from_secs(5), a.result())
        .await
        .expect("future never settled")
        .unwrap_err();
    assert!(fa.is_host_shutdown());
    let fb = b.result().await.unwrap_err();
    assert!(fb.is_host_shutdown());
}

#[tokio::test]
async fn submitting_after_shutdown_is_an_error() {
    let rig = start(1).await;

    rig.client.shutdown().await.unwrap();
    let err = rig.client.submit(JobSpec::call("echo")).await.unwrap_err();
    assert!(matches!(err, foreman::ForemanError::ChannelClosed));
}

#[tokio::test]
async fn progress_reports_are_forwarded_to_the_handle() {
    let mut rig = start(1).await;

    let handle = rig.client.submit(JobSpec::call("progressive")).await.unwrap();
    let id = handle.id();
    let progress = handle.progress();

    wait_for_state(&mut rig.events, id, JobState::Complete).await;
    handle.result().await.unwrap();

    let latest = progress.borrow().clone();
    assert_eq!(latest.value, Some(3));
    assert_eq!(latest.maximum, Some(3));
    assert_eq!(latest.status.as_deref(), Some("working"));
}

#[tokio::test]
async fn worker_notifications_default_title_to_the_job_name() {
    let rig = start(1).await;

    let handle = rig
        .client
        .submit(JobSpec::call("toast").name("warm the bread"))
        .await
        .unwrap();
    let id = handle.id();
    handle.result().await.unwrap();

    let notifications = rig.notifications.lock().unwrap();
    let toast = notifications
        .iter()
        .find(|(got, _)| *got == id)
        .map(|(_, n)| n)
        .expect("notification recorded");
    assert_eq!(toast.title, "warm the bread");
    assert_eq!(toast.message, "halfway there");
    assert!(!toast.sticky);
}
