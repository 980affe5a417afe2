//! Pull-based dispatcher.
//!
//! Runs inside the RequestJob handler on the connection's read loop, so at
//! most one dispatch per agent is in flight at a time. Every store write in
//! the commit chain has a compensating rollback; on any non-recoverable step
//! the job returns to PENDING plus the queue, so the coordinator never leaks
//! a half-assigned job.

use uuid::Uuid;

use crate::job::model::normalize_extension;
use crate::job::{Job, JobStatus, JobType};
use crate::proto::{self, envelope::Payload, storage_access, Envelope};
use crate::proto::{ForwardHttpSpec, HeaderPair, InputForwardModeCode, JobAssigned, JobKind, StorageAccess};

use super::{CloseConnection, ConnCtx, Gateway};

/// Stale queue entries tolerated per RequestJob before giving up.
pub const MAX_DEQUEUE_ATTEMPTS: usize = 5;

/// Lease TTL announced in JobAssigned. The expiry sweeper that would act on
/// it is future work; the field is carried so agents can surface it.
pub const LEASE_TTL_SECS: u32 = 60;

impl Gateway {
    pub(crate) async fn handle_request_job(
        &self,
        ctx: &ConnCtx,
        envelope: &Envelope,
        request: proto::RequestJob,
    ) -> Result<(), CloseConnection> {
        let agent_id = match &ctx.agent_id {
            Some(bound) => bound.clone(),
            None => {
                tracing::warn!("request_job from unregistered connection, dropping frame");
                return Ok(());
            }
        };
        if !envelope.agent_id.is_empty() && envelope.agent_id != agent_id {
            tracing::warn!(
                bound_agent_id = %agent_id,
                envelope_agent_id = %envelope.agent_id,
                "request_job agent_id mismatch, dropping frame"
            );
            return Ok(());
        }
        if !request.agent_id.is_empty() && request.agent_id != agent_id {
            tracing::warn!(
                bound_agent_id = %agent_id,
                payload_agent_id = %request.agent_id,
                "request_job agent_id mismatch, dropping frame"
            );
            return Ok(());
        }

        // Admission: no reply on rejection, the agent retries with backoff.
        let agent = match self.registry.get(&agent_id) {
            Some(agent) => agent,
            None => {
                tracing::debug!(agent_id = %agent_id, "request_job from offline agent");
                return Ok(());
            }
        };
        if agent.paused {
            tracing::debug!(agent_id = %agent_id, "agent paused, skipping assignment");
            return Ok(());
        }
        if agent.running_jobs >= agent.max_concurrency {
            tracing::debug!(
                agent_id = %agent_id,
                running = agent.running_jobs,
                max = agent.max_concurrency,
                "agent at capacity, skipping assignment"
            );
            return Ok(());
        }

        // The queue may hold ids for jobs that were canceled or already
        // assigned; skip a bounded number of them.
        let mut picked: Option<Job> = None;
        for _ in 0..MAX_DEQUEUE_ATTEMPTS {
            let job_id = match self.queue.dequeue().await {
                Ok(Some(job_id)) => job_id,
                Ok(None) => {
                    tracing::debug!(agent_id = %agent_id, "no job available");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "dequeue failed");
                    return Ok(());
                }
            };
            match self.store.get(&job_id).await {
                Ok(job) if job.status == JobStatus::Pending => {
                    picked = Some(job);
                    break;
                }
                Ok(job) => {
                    tracing::debug!(
                        job_id = %job_id,
                        status = %job.status,
                        "stale queue entry, trying next"
                    );
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, error = %e, "queued job not loadable, trying next");
                }
            }
        }
        let Some(mut job) = picked else {
            tracing::debug!(agent_id = %agent_id, "no PENDING job found within dequeue bound");
            return Ok(());
        };
        let job_id = job.job_id.clone();

        // Attempt-id normalization before any path is derived from it.
        if job.attempt_id < 1 {
            if let Err(e) = self.store.update_attempt_id(&job_id, 1).await {
                tracing::warn!(job_id = %job_id, error = %e, "attempt_id normalization failed, re-enqueuing");
                self.requeue(&job_id).await;
                return Ok(());
            }
            job.attempt_id = 1;
        }
        let attempt_id = job.attempt_id;

        let output_prefix = format!("jobs/{}/{}/", job_id, attempt_id);
        let output_key = format!(
            "{}output.{}",
            output_prefix,
            normalize_extension(&job.output_extension)
        );

        let input_access = if !job.input_key.is_empty() && !job.input_bucket.is_empty() {
            match self
                .signer
                .signed_download(&job.input_bucket, &job.input_key)
                .await
            {
                Ok(url) => Some(presigned(url)),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "input signing failed, re-enqueuing");
                    self.requeue(&job_id).await;
                    return Ok(());
                }
            }
        } else {
            None
        };

        let output_url = match self.signer.signed_upload(&job.output_bucket, &output_key).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "output signing failed, re-enqueuing");
                self.requeue(&job_id).await;
                return Ok(());
            }
        };

        // Commit chain. Assignment lands before ASSIGNED so a failure in
        // between leaves a PENDING record that simply returns to the queue.
        let lease_id = Uuid::new_v4().to_string();
        if let Err(e) = self
            .store
            .update_assignment(&job_id, &agent_id, &lease_id, None)
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "assignment write failed, re-enqueuing");
            self.requeue(&job_id).await;
            return Ok(());
        }

        if let Err(e) = self.store.update_status(&job_id, JobStatus::Assigned).await {
            tracing::warn!(job_id = %job_id, error = %e, "status write failed, reverting assignment");
            self.revert_assignment(&job_id).await;
            self.requeue(&job_id).await;
            return Ok(());
        }

        if let Err(e) = self
            .store
            .update_output(&job_id, &output_key, &output_prefix)
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "output write failed, rolling back");
            self.rollback_to_pending(&job_id).await;
            self.requeue(&job_id).await;
            return Ok(());
        }

        let assigned = proto::reply(
            &envelope.request_id,
            Payload::JobAssigned(JobAssigned {
                job_id: job_id.clone(),
                attempt_id,
                lease_id,
                lease_ttl_sec: LEASE_TTL_SECS,
                input_access,
                input_key: job.input_key.clone(),
                output_access: Some(presigned(output_url)),
                output_prefix,
                output_key: output_key.clone(),
                command: job.command.clone(),
                job_type: job_kind(&job) as i32,
                forward_http: job.forward.as_ref().map(forward_spec),
                input_forward_mode: forward_mode(&job) as i32,
            }),
        );

        if ctx.send(&assigned).is_err() {
            tracing::warn!(job_id = %job_id, "send buffer full during assignment, rolling back");
            self.rollback_to_pending(&job_id).await;
            self.requeue(&job_id).await;
            return Err(CloseConnection);
        }

        // Commit-after-send is safe: the next RequestJob on this connection
        // cannot be handled until this handler returns.
        self.registry.increment_running(&agent_id);
        tracing::info!(
            job_id = %job_id,
            attempt_id,
            agent_id = %agent_id,
            output_key = %output_key,
            "job assigned"
        );
        Ok(())
    }

    async fn requeue(&self, job_id: &str) {
        if let Err(e) = self.queue.enqueue(job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "re-enqueue failed, job stays recoverable from the store");
        }
    }

    async fn revert_assignment(&self, job_id: &str) {
        if let Err(e) = self.store.update_assignment(job_id, "", "", None).await {
            tracing::debug!(job_id = %job_id, error = %e, "assignment revert failed");
        }
    }

    /// Best-effort rollback of the full commit chain. The ASSIGNED -> PENDING
    /// revert is rejected by the state machine once ASSIGNED has landed; in
    /// that case the record stays ASSIGNED, the queue skips it as stale, and
    /// a future lease sweeper reaps it.
    async fn rollback_to_pending(&self, job_id: &str) {
        if let Err(e) = self.store.update_status(job_id, JobStatus::Pending).await {
            tracing::debug!(job_id = %job_id, error = %e, "status revert failed");
        }
        self.revert_assignment(job_id).await;
    }
}

fn presigned(url: String) -> StorageAccess {
    StorageAccess {
        auth: Some(storage_access::Auth::PresignedUrl(url)),
    }
}

fn job_kind(job: &Job) -> JobKind {
    match job.job_type {
        JobType::Command => JobKind::Command,
        JobType::ForwardHttp => JobKind::ForwardHttp,
    }
}

fn forward_mode(job: &Job) -> InputForwardModeCode {
    match job.input_forward_mode {
        crate::job::InputForwardMode::Url => InputForwardModeCode::Url,
        crate::job::InputForwardMode::LocalFile => InputForwardModeCode::LocalFile,
    }
}

fn forward_spec(spec: &crate::job::ForwardSpec) -> ForwardHttpSpec {
    ForwardHttpSpec {
        url: spec.url.clone(),
        method: spec.method.clone(),
        headers: spec
            .headers
            .iter()
            .map(|(key, value)| HeaderPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        body: spec.body.clone().into_bytes(),
        timeout_sec: spec.timeout_sec,
    }
}
