//! Reconciler rules: ownership, attempt matching, terminal protection,
//! output-key validation, and capacity release.


use std::time::Duration;

use edgelink::job::{Job, JobStatus, JobStore};
use edgelink::proto::JobState;

use test_harness::{assert_eventually, ControlClient, StubObjectStore, TestCoordinator};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

fn pending_job(job_id: &str) -> Job {
    let mut job = Job::new(job_id);
    job.output_bucket = "b".to_string();
    job.command = "echo hi".to_string();
    job
}

/// Seeds a job, registers `agent_id`, and drives the job to ASSIGNED.
async fn assign_one(
    coordinator: &TestCoordinator,
    client: &mut ControlClient,
    job_id: &str,
) -> edgelink::proto::JobAssigned {
    coordinator.seed_job(&pending_job(job_id)).await;
    client
        .request_and_expect_assignment(REPLY_TIMEOUT)
        .await
        .expect("assignment")
}

async fn wait_for_status(coordinator: &TestCoordinator, job_id: &str, status: JobStatus) {
    let store = coordinator.store.clone();
    let job_id = job_id.to_string();
    assert_eventually(
        || {
            let store = store.clone();
            let job_id = job_id.clone();
            async move {
                store
                    .get(&job_id)
                    .await
                    .map(|j| j.status == status)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(2),
        &format!("job {job_id} should reach {status}"),
    )
    .await;
}

#[tokio::test]
async fn running_report_persists_progress_output() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-run").await;

    client
        .report(
            &assigned.job_id,
            1,
            JobState::Running,
            "Processing job",
            "",
            "halfway there",
            "",
        )
        .await;

    wait_for_status(&coordinator, "j-run", JobStatus::Running).await;
    let stored = coordinator.store.get("j-run").await.unwrap();
    assert_eq!(stored.stdout, "halfway there");
}

#[tokio::test]
async fn succeeded_with_matching_key_lands() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-good").await;

    client
        .report(&assigned.job_id, 1, JobState::Running, "", "", "", "")
        .await;
    client
        .report(
            &assigned.job_id,
            1,
            JobState::Succeeded,
            "",
            &assigned.output_key,
            "all done",
            "",
        )
        .await;

    wait_for_status(&coordinator, "j-good", JobStatus::Succeeded).await;
    let stored = coordinator.store.get("j-good").await.unwrap();
    assert_eq!(stored.output_key, assigned.output_key);
    assert_eq!(stored.stdout, "all done");
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 0);
}

#[tokio::test]
async fn succeeded_with_empty_key_is_a_stdout_only_job() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-stdout").await;

    client
        .report(&assigned.job_id, 1, JobState::Running, "", "", "", "")
        .await;
    client
        .report(&assigned.job_id, 1, JobState::Succeeded, "", "", "plain text", "")
        .await;

    wait_for_status(&coordinator, "j-stdout", JobStatus::Succeeded).await;
    // The assigned key remains on record even though nothing was uploaded.
    let stored = coordinator.store.get("j-stdout").await.unwrap();
    assert_eq!(stored.output_key, assigned.output_key);
}

#[tokio::test]
async fn output_key_mismatch_fails_the_job_without_polluting_the_key() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-wrongkey").await;

    client
        .report(&assigned.job_id, 1, JobState::Running, "", "", "", "")
        .await;
    client
        .report(
            &assigned.job_id,
            1,
            JobState::Succeeded,
            "",
            "jobs/j-wrongkey/1/wrong.bin",
            "",
            "",
        )
        .await;

    wait_for_status(&coordinator, "j-wrongkey", JobStatus::Failed).await;
    let stored = coordinator.store.get("j-wrongkey").await.unwrap();
    assert_eq!(stored.output_key, assigned.output_key, "stored key untouched");
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 0);
}

#[tokio::test]
async fn failed_report_persists_diagnostics() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-fail").await;

    client
        .report(&assigned.job_id, 1, JobState::Running, "", "", "", "")
        .await;
    client
        .report(
            &assigned.job_id,
            1,
            JobState::Failed,
            "Command execution failed: exit status Some(2)",
            "",
            "partial",
            "no such file",
        )
        .await;

    wait_for_status(&coordinator, "j-fail", JobStatus::Failed).await;
    let stored = coordinator.store.get("j-fail").await.unwrap();
    assert_eq!(stored.message, "Command execution failed: exit status Some(2)");
    assert_eq!(stored.stdout, "partial");
    assert_eq!(stored.stderr, "no such file");
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 0);
}

#[tokio::test]
async fn duplicate_terminal_delivery_is_idempotent() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-dup").await;

    client
        .report(&assigned.job_id, 1, JobState::Running, "", "", "", "")
        .await;
    client
        .report(&assigned.job_id, 1, JobState::Succeeded, "", &assigned.output_key, "", "")
        .await;
    wait_for_status(&coordinator, "j-dup", JobStatus::Succeeded).await;

    // Redelivery of the same terminal, then a conflicting terminal.
    client
        .report(&assigned.job_id, 1, JobState::Succeeded, "", &assigned.output_key, "", "")
        .await;
    client
        .report(&assigned.job_id, 1, JobState::Failed, "late failure", "", "", "")
        .await;

    // Use a heartbeat round-trip as a barrier: once acked, both reports
    // above have been processed by the sequential per-connection handler.
    client.heartbeat(false, 0).await;

    let stored = coordinator.store.get("j-dup").await.unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(stored.message, "");
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 0);
}

#[tokio::test]
async fn reports_from_non_owners_are_discarded() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut owner = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    let mut intruder = ControlClient::connect(&coordinator.ws_url(), "a2").await;
    owner.register(1).await;
    intruder.register(1).await;
    let assigned = assign_one(&coordinator, &mut owner, "j-owned").await;

    intruder
        .report(&assigned.job_id, 1, JobState::Failed, "hijack", "", "", "")
        .await;
    intruder.heartbeat(false, 0).await;

    let stored = coordinator.store.get("j-owned").await.unwrap();
    assert_eq!(stored.status, JobStatus::Assigned);
    assert_eq!(stored.message, "");
}

#[tokio::test]
async fn attempt_mismatch_is_discarded() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-attempt").await;

    client
        .report(&assigned.job_id, 2, JobState::Running, "", "", "", "")
        .await;
    client.heartbeat(false, 0).await;

    let stored = coordinator.store.get("j-attempt").await.unwrap();
    assert_eq!(stored.status, JobStatus::Assigned);
}

#[tokio::test]
async fn lost_report_reaches_terminal_and_releases_capacity() {
    let object_store = StubObjectStore::start().await;
    let coordinator = TestCoordinator::start_with_object_store(&object_store, "b").await;
    let mut client = ControlClient::connect(&coordinator.ws_url(), "a1").await;
    client.register(1).await;
    let assigned = assign_one(&coordinator, &mut client, "j-lost").await;

    client
        .report(&assigned.job_id, 1, JobState::Lost, "", "", "", "")
        .await;

    wait_for_status(&coordinator, "j-lost", JobStatus::Lost).await;
    assert_eq!(coordinator.registry.get("a1").unwrap().running_jobs, 0);
}
