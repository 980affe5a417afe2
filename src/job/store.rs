//! Job persistence contract and the in-memory implementation.
//!
//! The store is the authoritative record of every job. All status writes go
//! through [`JobStore::update_status`], which validates the transition inside
//! a single critical section so concurrent writers cannot race a terminal
//! state backwards.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::job::model::{Job, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validates invariants, normalizes the output layout, and persists the
    /// record. Fails with `Conflict` when the job_id already exists.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Job, StoreError>;

    /// Applies the transition only if `current -> target` is an edge of the
    /// lifecycle state machine; read and write happen atomically.
    async fn update_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError>;

    async fn update_assignment(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_id: &str,
        lease_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn update_output(
        &self,
        job_id: &str,
        output_key: &str,
        output_prefix: &str,
    ) -> Result<(), StoreError>;

    async fn update_attempt_id(&self, job_id: &str, attempt_id: i32) -> Result<(), StoreError>;

    async fn update_stdout_stderr(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError>;

    async fn update_message(&self, job_id: &str, message: &str) -> Result<(), StoreError>;

    /// Newest-first listing with optional status filter.
    async fn list(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;
}

/// HashMap-backed store. The default for dev runs and tests; durable
/// deployments use [`crate::job::SqliteJobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut Job) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(job_id).ok_or(StoreError::NotFound)?;
        f(job)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        job.validate()?;
        let mut record = job.clone();
        record.normalize_output_layout();

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&record.job_id) {
            return Err(StoreError::Conflict(format!(
                "job {} already exists",
                record.job_id
            )));
        }
        jobs.insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            if !job.status.can_transition_to(target) {
                return Err(StoreError::InvalidTransition {
                    from: job.status,
                    to: target,
                });
            }
            job.status = target;
            Ok(())
        })
    }

    async fn update_assignment(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_id: &str,
        lease_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.assigned_agent_id = agent_id.to_string();
            job.lease_id = lease_id.to_string();
            job.lease_deadline = lease_deadline;
            Ok(())
        })
    }

    async fn update_output(
        &self,
        job_id: &str,
        output_key: &str,
        output_prefix: &str,
    ) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.output_key = output_key.to_string();
            job.output_prefix = output_prefix.to_string();
            Ok(())
        })
    }

    async fn update_attempt_id(&self, job_id: &str, attempt_id: i32) -> Result<(), StoreError> {
        if attempt_id < 1 {
            return Err(StoreError::InvalidJob("attempt_id must be >= 1".into()));
        }
        self.with_job(job_id, |job| {
            job.attempt_id = attempt_id;
            Ok(())
        })
    }

    async fn update_stdout_stderr(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.stdout = stdout.to_string();
            job.stderr = stderr.to_string();
            Ok(())
        })
    }

    async fn update_message(&self, job_id: &str, message: &str) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.message = message.to_string();
            Ok(())
        })
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<Job> = jobs
            .values()
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(selected.into_iter().skip(offset).take(limit).collect())
    }
}
