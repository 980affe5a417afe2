//! Status reconciler.
//!
//! Validates incoming JobStatus reports and drives the job state machine.
//! Rules apply in order: ownership, attempt match, terminal protection,
//! transition validity, per-status side effects, capacity release. A report
//! that fails any rule is discarded; the store's transition validation is
//! the final guard against races.

use crate::job::JobStatus;
use crate::proto::{self, Envelope, JobState};

use super::{CloseConnection, ConnCtx, Gateway};

impl Gateway {
    pub(crate) async fn handle_job_status(
        &self,
        ctx: &ConnCtx,
        envelope: &Envelope,
        status: proto::JobStatus,
    ) -> Result<(), CloseConnection> {
        let agent_id = envelope.agent_id.clone();
        if agent_id.is_empty() {
            tracing::warn!("job_status missing agent_id, dropping frame");
            return Ok(());
        }
        if ctx.agent_id.as_deref() != Some(agent_id.as_str()) {
            tracing::warn!(
                envelope_agent_id = %agent_id,
                "job_status from connection not bound to that agent, dropping frame"
            );
            return Ok(());
        }
        let job_id = status.job_id.clone();
        if job_id.is_empty() {
            tracing::warn!(agent_id = %agent_id, "job_status missing job_id, dropping frame");
            return Ok(());
        }

        let job = match self.store.get(&job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, agent_id = %agent_id, error = %e, "job_status for unknown job");
                return Ok(());
            }
        };

        // Ownership: only the assigned agent may report on a job.
        if job.assigned_agent_id != agent_id {
            tracing::warn!(
                job_id = %job_id,
                agent_id = %agent_id,
                assigned_agent_id = %job.assigned_agent_id,
                "job_status from non-owner, dropping frame"
            );
            return Ok(());
        }

        if status.attempt_id != job.attempt_id {
            tracing::warn!(
                job_id = %job_id,
                reported = status.attempt_id,
                expected = job.attempt_id,
                "job_status attempt_id mismatch, dropping frame"
            );
            return Ok(());
        }

        let new_status = match JobState::try_from(status.status).ok().and_then(wire_to_status) {
            Some(new_status) => new_status,
            None => {
                tracing::warn!(
                    job_id = %job_id,
                    agent_id = %agent_id,
                    raw = status.status,
                    "job_status carries invalid status, dropping frame"
                );
                return Ok(());
            }
        };

        // Terminal protection: duplicate delivery of a terminal report is
        // expected and silently ignored.
        if job.status.is_terminal() {
            tracing::debug!(
                job_id = %job_id,
                current = %job.status,
                reported = %new_status,
                "job already terminal, ignoring report"
            );
            return Ok(());
        }

        match new_status {
            JobStatus::Running => {
                if !status.stdout.is_empty() || !status.stderr.is_empty() {
                    if let Err(e) = self
                        .store
                        .update_stdout_stderr(&job_id, &status.stdout, &status.stderr)
                        .await
                    {
                        tracing::warn!(job_id = %job_id, error = %e, "progress output write failed");
                    }
                }
                if let Err(e) = self.store.update_status(&job_id, JobStatus::Running).await {
                    tracing::warn!(job_id = %job_id, error = %e, "transition to RUNNING rejected");
                    return Ok(());
                }
                tracing::info!(job_id = %job_id, attempt_id = job.attempt_id, agent_id = %agent_id, "job running");
            }

            JobStatus::Succeeded => {
                if let Err(e) = self
                    .store
                    .update_stdout_stderr(&job_id, &status.stdout, &status.stderr)
                    .await
                {
                    tracing::warn!(job_id = %job_id, error = %e, "output capture write failed");
                }

                // An empty reported key means a stdout-only job. A non-empty
                // key must exactly match the assigned key; anything else is a
                // misdirected upload and fails the job without polluting the
                // stored key.
                if !status.output_key.is_empty() && status.output_key != job.output_key {
                    tracing::warn!(
                        job_id = %job_id,
                        reported = %status.output_key,
                        expected = %job.output_key,
                        "output_key mismatch, marking job FAILED"
                    );
                    if let Err(e) = self.store.update_status(&job_id, JobStatus::Failed).await {
                        tracing::warn!(job_id = %job_id, error = %e, "transition to FAILED rejected");
                    } else {
                        self.registry.release_running(&agent_id);
                    }
                    return Ok(());
                }

                if let Err(e) = self.store.update_status(&job_id, JobStatus::Succeeded).await {
                    tracing::warn!(job_id = %job_id, error = %e, "transition to SUCCEEDED rejected");
                    return Ok(());
                }
                tracing::info!(
                    job_id = %job_id,
                    attempt_id = job.attempt_id,
                    agent_id = %agent_id,
                    output_key = %status.output_key,
                    "job succeeded"
                );
                self.registry.release_running(&agent_id);
            }

            JobStatus::Failed => {
                if let Err(e) = self
                    .store
                    .update_stdout_stderr(&job_id, &status.stdout, &status.stderr)
                    .await
                {
                    tracing::warn!(job_id = %job_id, error = %e, "output capture write failed");
                }
                if !status.message.is_empty() {
                    if let Err(e) = self.store.update_message(&job_id, &status.message).await {
                        tracing::warn!(job_id = %job_id, error = %e, "failure message write failed");
                    }
                }
                if let Err(e) = self.store.update_status(&job_id, JobStatus::Failed).await {
                    tracing::warn!(job_id = %job_id, error = %e, "transition to FAILED rejected");
                    return Ok(());
                }
                tracing::info!(
                    job_id = %job_id,
                    attempt_id = job.attempt_id,
                    agent_id = %agent_id,
                    message = %status.message,
                    "job failed"
                );
                self.registry.release_running(&agent_id);
            }

            JobStatus::Canceled | JobStatus::Lost => {
                if !job.status.can_transition_to(new_status) {
                    tracing::warn!(
                        job_id = %job_id,
                        from = %job.status,
                        to = %new_status,
                        "invalid transition reported, dropping"
                    );
                    return Ok(());
                }
                if let Err(e) = self.store.update_status(&job_id, new_status).await {
                    tracing::warn!(job_id = %job_id, error = %e, "transition rejected");
                    return Ok(());
                }
                tracing::info!(job_id = %job_id, status = %new_status, agent_id = %agent_id, "job reached terminal status");
                self.registry.release_running(&agent_id);
            }

            JobStatus::Pending | JobStatus::Assigned => {
                // Agents have no business reporting these, but the store's
                // transition validation decides, matching every other writer.
                if !job.status.can_transition_to(new_status) {
                    tracing::warn!(
                        job_id = %job_id,
                        from = %job.status,
                        to = %new_status,
                        "invalid transition reported, dropping"
                    );
                    return Ok(());
                }
                if let Err(e) = self.store.update_status(&job_id, new_status).await {
                    tracing::warn!(job_id = %job_id, error = %e, "transition rejected");
                }
            }
        }
        Ok(())
    }
}

fn wire_to_status(state: JobState) -> Option<JobStatus> {
    match state {
        JobState::Pending => Some(JobStatus::Pending),
        JobState::Assigned => Some(JobStatus::Assigned),
        JobState::Running => Some(JobStatus::Running),
        JobState::Succeeded => Some(JobStatus::Succeeded),
        JobState::Failed => Some(JobStatus::Failed),
        JobState::Canceled => Some(JobStatus::Canceled),
        JobState::Lost => Some(JobStatus::Lost),
        JobState::Unspecified => None,
    }
}
