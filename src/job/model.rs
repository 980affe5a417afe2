use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Upper bound on the command-line string accepted at submission.
pub const MAX_COMMAND_CHARS: usize = 8192;

/// Default output file extension when the submitter does not pick one.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Lost,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Assigned => "ASSIGNED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Lost => "LOST",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "ASSIGNED" => Ok(JobStatus::Assigned),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELED" => Ok(JobStatus::Canceled),
            "LOST" => Ok(JobStatus::Lost),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

impl JobStatus {
    /// Once a job reaches a terminal status it never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Lost
        )
    }

    /// The edges of the job lifecycle state machine.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        match self {
            JobStatus::Pending => {
                matches!(target, JobStatus::Assigned | JobStatus::Canceled)
            }
            JobStatus::Assigned => matches!(
                target,
                JobStatus::Running | JobStatus::Canceled | JobStatus::Lost
            ),
            JobStatus::Running => matches!(
                target,
                JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Lost
            ),
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Lost => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[default]
    Command,
    ForwardHttp,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Command => write!(f, "COMMAND"),
            JobType::ForwardHttp => write!(f, "FORWARD_HTTP"),
        }
    }
}

impl FromStr for JobType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "COMMAND" => Ok(JobType::Command),
            "FORWARD_HTTP" => Ok(JobType::ForwardHttp),
            other => Err(StoreError::InvalidJob(format!("unknown job_type: {other}"))),
        }
    }
}

/// How a forward-HTTP job hands its input to the local service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputForwardMode {
    /// Pass the signed URL through headers / JSON body.
    #[default]
    Url,
    /// Download (via the input cache) and attach as a multipart file part.
    LocalFile,
}

impl fmt::Display for InputForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputForwardMode::Url => write!(f, "URL"),
            InputForwardMode::LocalFile => write!(f, "LOCAL_FILE"),
        }
    }
}

impl FromStr for InputForwardMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "URL" => Ok(InputForwardMode::Url),
            "LOCAL_FILE" => Ok(InputForwardMode::LocalFile),
            other => Err(StoreError::InvalidJob(format!(
                "unknown input_forward_mode: {other}"
            ))),
        }
    }
}

/// Target description for a FORWARD_HTTP job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub url: String,
    /// HTTP method; empty means POST.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Raw request body. Empty lets the agent substitute an input-reference
    /// JSON body in URL mode.
    #[serde(default)]
    pub body: String,
    /// 0 means no per-job timeout beyond the transport default.
    #[serde(default)]
    pub timeout_sec: u32,
}

/// A compute job record. Created once by the submission API, mutated only by
/// the dispatcher (assignment, output layout) and the reconciler (status,
/// execution record), never destroyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub job_type: JobType,
    pub input_bucket: String,
    pub input_key: String,
    pub output_bucket: String,
    pub output_key: String,
    pub output_prefix: String,
    pub output_extension: String,
    pub attempt_id: i32,
    pub assigned_agent_id: String,
    pub lease_id: String,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub command: String,
    pub forward: Option<ForwardSpec>,
    pub input_forward_mode: InputForwardMode,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

impl Job {
    /// A fresh PENDING record with defaults for everything but identity.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            created_at: Utc::now(),
            status: JobStatus::Pending,
            job_type: JobType::Command,
            input_bucket: String::new(),
            input_key: String::new(),
            output_bucket: String::new(),
            output_key: String::new(),
            output_prefix: String::new(),
            output_extension: DEFAULT_OUTPUT_EXTENSION.to_string(),
            attempt_id: 1,
            assigned_agent_id: String::new(),
            lease_id: String::new(),
            lease_deadline: None,
            command: String::new(),
            forward: None,
            input_forward_mode: InputForwardMode::Url,
            message: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.job_id.is_empty() {
            return Err(StoreError::InvalidJob("job_id cannot be empty".into()));
        }
        // Input is optional, but bucket and key travel together.
        if self.input_bucket.is_empty() != self.input_key.is_empty() {
            return Err(StoreError::InvalidJob(
                "input_bucket and input_key must both be provided or both be empty".into(),
            ));
        }
        if self.attempt_id < 1 {
            return Err(StoreError::InvalidJob("attempt_id must be >= 1".into()));
        }
        if self.job_type == JobType::ForwardHttp
            && self
                .forward
                .as_ref()
                .map(|f| f.url.trim().is_empty())
                .unwrap_or(true)
        {
            return Err(StoreError::InvalidJob(
                "forward url is required for FORWARD_HTTP jobs".into(),
            ));
        }
        Ok(())
    }

    /// The canonical object prefix for this job's current attempt.
    pub fn default_output_prefix(&self) -> String {
        format!("jobs/{}/{}/", self.job_id, self.attempt_id)
    }

    /// Forces the output layout onto the canonical `jobs/{job_id}/{attempt_id}/`
    /// prefix. A submitted `output_key` that does not sit under the canonical
    /// prefix is silently dropped in favor of prefix-based addressing; callers
    /// of the submission API should not rely on custom output keys surviving.
    pub fn normalize_output_layout(&mut self) {
        let expected = self.default_output_prefix();

        if self.output_prefix.is_empty() && self.output_key.is_empty() {
            self.output_prefix = expected;
        } else if !self.output_prefix.is_empty() {
            if self.output_prefix != expected && !self.output_prefix.starts_with(&expected) {
                self.output_prefix = expected;
            }
        } else {
            // Key-only submission converts to prefix-based addressing.
            self.output_prefix = expected;
            self.output_key = String::new();
        }
    }
}

/// Strips a leading dot and substitutes the default when empty, so the
/// dispatcher always produces `output.{ext}`.
pub fn normalize_extension(extension: &str) -> String {
    let ext = extension.strip_prefix('.').unwrap_or(extension);
    if ext.is_empty() {
        DEFAULT_OUTPUT_EXTENSION.to_string()
    } else {
        ext.to_string()
    }
}
