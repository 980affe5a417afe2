//! Dispatcher behavior over a live gateway connection: admission, stale
//! queue entries, capacity, and compensation on signing failure.


use std::sync::Arc;
use std::time::Duration;

use edgelink::job::{Job, JobStatus, JobStore};
use edgelink::proto::JobState;
use edgelink::queue::PendingQueue;

use test_harness::{assert_eventually, ControlClient, FailingSigner, StubObjectStore, TestCoordinator};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const NO_REPLY_TIMEOUT: Duration = Duration::from_millis(300);

fn pending_job(job_id: &str) -> Job {
    let mut job = Job::new(job_id);
    job.output_bucket = "b".to_string();
    job.command = "echo hi".to_string();
    job
}

#[tokio::test]
async fn assignment_carries_canonical_output_layout() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;

    let mut job = pending_job("j-layout");
    job.input_bucket = "b".to_string();
    job.input_key = "in/asset.png".to_string();
    job.output_extension = "json".to_string();
    coordinator.seed_job(&job).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    assert!(client.register(1).await.success);

    let assigned = client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("assignment");
    assert_eq!(assigned.job_id, "j-layout");
    assert_eq!(assigned.attempt_id, 1);
    assert_eq!(assigned.output_prefix, "jobs/j-layout/1/");
    assert_eq!(assigned.output_key, "jobs/j-layout/1/output.json");
    assert!(!assigned.lease_id.is_empty());
    assert!(assigned.input_access.is_some());
    assert!(assigned.output_access.is_some());

    let stored = coordinator.store.get("j-layout").await.unwrap();
    assert_eq!(stored.status, JobStatus::Assigned);
    assert_eq!(stored.assigned_agent_id, "a1");
    assert_eq!(stored.output_key, "jobs/j-layout/1/output.json");
    assert_eq!(stored.lease_id, assigned.lease_id);
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 1);
}

#[tokio::test]
async fn jobs_without_input_get_no_input_access() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    coordinator.seed_job(&pending_job("j-noinput")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;

    let assigned = client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("assignment");
    assert!(assigned.input_access.is_none());
    assert_eq!(assigned.input_key, "");
    assert_eq!(assigned.output_key, "jobs/j-noinput/1/output.bin");
}

#[tokio::test]
async fn dispatch_skips_stale_queue_entries() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;

    // J_stale sits in the queue but is already ASSIGNED in the store.
    let stale = pending_job("j-stale");
    coordinator.seed_job(&stale).await;
    coordinator
        .store
        .update_status("j-stale", JobStatus::Assigned)
        .await
        .unwrap();
    coordinator.seed_job(&pending_job("j-ok")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;

    let assigned = client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("assignment");
    assert_eq!(assigned.job_id, "j-ok");
    assert_eq!(
        coordinator.store.get("j-ok").await.unwrap().status,
        JobStatus::Assigned
    );
}

#[tokio::test]
async fn dequeue_bound_stops_after_five_stale_entries() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;

    // Five ids with no backing job, then a dispatchable one.
    for i in 0..5 {
        coordinator.queue.enqueue(&format!("ghost-{i}")).await.unwrap();
    }
    coordinator.seed_job(&pending_job("j-late")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;

    // First request burns the five stale entries and assigns nothing.
    assert!(client
        .request_and_expect_assignment(NO_REPLY_TIMEOUT)
        .await
        .is_none());
    assert_eq!(coordinator.queue.size().await.unwrap(), 1);

    // The good entry is still queued for the next pull.
    let assigned = client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("assignment");
    assert_eq!(assigned.job_id, "j-late");
}

#[tokio::test]
async fn capacity_is_enforced_until_terminal_report() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    coordinator.seed_job(&pending_job("j-first")).await;
    coordinator.seed_job(&pending_job("j-second")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;

    let first = client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("first assignment");
    assert_eq!(first.job_id, "j-first");

    // At max_concurrency: no reply, queue untouched.
    assert!(client
        .request_and_expect_assignment(NO_REPLY_TIMEOUT)
        .await
        .is_none());
    assert_eq!(coordinator.queue.size().await.unwrap(), 1);

    client
        .report(&first.job_id, 1, JobState::Running, "Processing job", "", "", "")
        .await;
    client
        .report(&first.job_id, 1, JobState::Succeeded, "", &first.output_key, "", "")
        .await;

    let registry = coordinator.registry.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.get("a1").map(|a| a.running_jobs) == Some(0) }
        },
        Duration::from_secs(2),
        "capacity released after terminal report",
    )
    .await;

    let second = client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("second assignment");
    assert_eq!(second.job_id, "j-second");
}

#[tokio::test]
async fn paused_agents_are_not_admitted() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    coordinator.seed_job(&pending_job("j-paused")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    client.heartbeat(true, 0).await;

    assert!(client
        .request_and_expect_assignment(NO_REPLY_TIMEOUT)
        .await
        .is_none());
    assert_eq!(coordinator.queue.size().await.unwrap(), 1);

    client.heartbeat(false, 0).await;
    assert!(client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .is_some());
}

#[tokio::test]
async fn signing_failure_compensates_back_to_pending() {
    let coordinator = TestCoordinator::start(Arc::new(FailingSigner)).await;
    coordinator.seed_job(&pending_job("j-sign")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;

    assert!(client
        .request_and_expect_assignment(NO_REPLY_TIMEOUT)
        .await
        .is_none());

    let stored = coordinator.store.get("j-sign").await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.assigned_agent_id, "");
    assert_eq!(coordinator.queue.size().await.unwrap(), 1);
    assert_eq!(
        coordinator.queue.peek().await.unwrap().as_deref(),
        Some("j-sign")
    );
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 0);
}

#[tokio::test]
async fn unregistered_connections_get_nothing() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    coordinator.seed_job(&pending_job("j-unreg")).await;

    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    // No Register first.
    assert!(client
        .request_and_expect_assignment(NO_REPLY_TIMEOUT)
        .await
        .is_none());
    assert_eq!(coordinator.queue.size().await.unwrap(), 1);
}

#[tokio::test]
async fn each_job_is_assigned_exactly_once() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    coordinator.seed_job(&pending_job("j-once")).await;

    let mut a1 = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    let mut a2 = ControlClient::connect(&coordinator.ws_url(), "a2").await;
    a1.register(1).await;
    a2.register(1).await;

    let first = a1.request_and_expect_assignment(REPLY_TIMEOUT).await;
    let second = a2.request_and_expect_assignment(NO_REPLY_TIMEOUT).await;
    assert!(first.is_some());
    assert!(second.is_none(), "a single job must not be assigned twice");
}
