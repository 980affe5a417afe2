//! COMMAND job execution.
//!
//! Flow per job: acquire the input through its signed URL, substitute the
//! `{input}`/`{output}` placeholders, run the command line through the
//! platform shell under a hard timeout, then either upload the output file
//! through the signed PUT URL or fall back to stdout-only reporting. Temp
//! files are removed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::process::Command;

use crate::proto::{storage_access, JobAssigned, JobKind, JobState, StorageAccess};

use super::cache::download_to;
use super::{forward, AgentError, AgentShared};

/// Hard ceiling on command runtime; the process is killed at the limit.
pub(crate) const EXEC_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Captured stdout/stderr are truncated to this many bytes.
pub const OUTPUT_CAP_BYTES: usize = 10 * 1024;

pub const TRUNCATION_MARKER: &str = "... (truncated)";

/// What the executor sends back when a job finishes, success or not.
pub(crate) struct JobReport {
    pub state: JobState,
    pub message: String,
    pub output_key: String,
    pub stdout: String,
    pub stderr: String,
}

impl JobReport {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            message: message.into(),
            output_key: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

pub(crate) async fn run_job(shared: Arc<AgentShared>, assigned: JobAssigned) {
    let job_id = assigned.job_id.clone();
    let attempt_id = assigned.attempt_id;

    shared
        .report_status(
            &job_id,
            attempt_id,
            JobState::Running,
            "Processing job",
            "",
            "",
            "",
        )
        .await;

    if assigned.job_type == JobKind::ForwardHttp as i32 {
        forward::run_forward_job(shared, assigned).await;
        return;
    }

    let mut scratch: Vec<PathBuf> = Vec::new();
    let report = command_job(&shared, &assigned, &mut scratch).await;
    for path in scratch {
        let _ = tokio::fs::remove_file(&path).await;
    }
    shared
        .report_status(
            &job_id,
            attempt_id,
            report.state,
            &report.message,
            &report.output_key,
            &report.stdout,
            &report.stderr,
        )
        .await;
}

async fn command_job(
    shared: &AgentShared,
    assigned: &JobAssigned,
    scratch: &mut Vec<PathBuf>,
) -> JobReport {
    if assigned.command.is_empty() {
        return JobReport::failed("Command is required");
    }

    // Input is optional; both the key and the access grant must be present.
    let input_path = if !assigned.input_key.is_empty() && assigned.input_access.is_some() {
        let url = match resolve_presigned(assigned.input_access.as_ref(), "input_access") {
            Ok(url) => url,
            Err(message) => return JobReport::failed(message),
        };
        let path = std::env::temp_dir().join(format!(
            "job_{}_input{}",
            assigned.job_id,
            input_extension(&assigned.input_key)
        ));
        scratch.push(path.clone());
        if let Err(e) = download_to(&shared.http, &url, &path).await {
            return JobReport::failed(format!("Download failed: {e}"));
        }
        tracing::debug!(job_id = %assigned.job_id, path = %path.display(), "input downloaded");
        path.display().to_string()
    } else {
        String::new()
    };

    let output_path = std::env::temp_dir().join(format!("job_{}_output", assigned.job_id));
    scratch.push(output_path.clone());

    let command_line = substitute_placeholders(
        &assigned.command,
        &input_path,
        &output_path.display().to_string(),
    );
    tracing::info!(job_id = %assigned.job_id, command = %command_line, "executing command");

    let outcome = execute_command(&command_line).await;
    if let Some(error) = outcome.error {
        return JobReport {
            state: JobState::Failed,
            message: format!("Command execution failed: {error}"),
            output_key: String::new(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        };
    }

    // The output file, when present and non-empty, is the payload to upload.
    // Otherwise the job is stdout-only and nothing goes to the object store.
    let file_payload = match tokio::fs::read(&output_path).await {
        Ok(data) if !data.is_empty() => Some(data),
        _ => None,
    };

    let mut output_key_to_report = String::new();
    if let Some(data) = file_payload {
        let url = match resolve_presigned(assigned.output_access.as_ref(), "output_access") {
            Ok(url) => url,
            Err(message) => {
                return JobReport {
                    state: JobState::Failed,
                    message,
                    output_key: String::new(),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                }
            }
        };
        if let Err(e) = upload_output(&shared.http, &url, data).await {
            return JobReport {
                state: JobState::Failed,
                message: format!("Upload failed: {e}"),
                output_key: String::new(),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            };
        }
        output_key_to_report = assigned.output_key.clone();
        tracing::info!(job_id = %assigned.job_id, output_key = %output_key_to_report, "output uploaded");
    }

    JobReport {
        state: JobState::Succeeded,
        message: String::new(),
        output_key: output_key_to_report,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
    }
}

pub(crate) struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

async fn execute_command(command_line: &str) -> ExecOutcome {
    let mut command = shell_command(command_line);
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutcome {
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("spawn failed: {e}")),
            }
        }
    };

    let output = match tokio::time::timeout(EXEC_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return ExecOutcome {
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("wait failed: {e}")),
            }
        }
        // The dropped future kills the child via kill_on_drop; captured
        // output is unrecoverable at that point.
        Err(_) => {
            return ExecOutcome {
                stdout: String::new(),
                stderr: String::new(),
                error: Some("command timed out after 30 minutes".to_string()),
            }
        }
    };

    let stdout = truncate_output(&sanitize_output(&output.stdout), OUTPUT_CAP_BYTES);
    let stderr = truncate_output(&sanitize_output(&output.stderr), OUTPUT_CAP_BYTES);
    let error = if output.status.success() {
        None
    } else if stderr.is_empty() {
        Some(format!("exit status {:?}", output.status.code()))
    } else {
        Some(stderr.clone())
    };

    ExecOutcome {
        stdout,
        stderr,
        error,
    }
}

fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd.exe");
        command.arg("/C").arg(command_line);
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    }
}

/// Literal replacement of the `{input}` and `{output}` tokens.
pub fn substitute_placeholders(command: &str, input_path: &str, output_path: &str) -> String {
    command
        .replace("{input}", input_path)
        .replace("{output}", output_path)
}

/// Command output must be valid UTF-8 before it can travel in a protobuf
/// string field; invalid sequences become U+FFFD. Idempotent.
pub fn sanitize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Caps `s` at `max_bytes`, backing off to a char boundary so the marker is
/// the only modification.
pub fn truncate_output(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

/// File extension of an object key, dot included, so invoked tools can
/// dispatch on file type. Empty when the key has none.
pub fn input_extension(input_key: &str) -> String {
    Path::new(input_key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// Unwraps the presigned URL out of a storage access grant. STS credentials
/// are a reserved wire variant and rejected here.
pub(crate) fn resolve_presigned(
    access: Option<&StorageAccess>,
    label: &str,
) -> Result<String, String> {
    match access.and_then(|a| a.auth.as_ref()) {
        Some(storage_access::Auth::PresignedUrl(url)) => Ok(url.clone()),
        Some(storage_access::Auth::Sts(_)) => Err(format!("{label} STS not supported")),
        None => Err(format!("Missing {label}")),
    }
}

pub(crate) async fn upload_output(
    client: &reqwest::Client,
    url: &str,
    data: Vec<u8>,
) -> Result<(), AgentError> {
    let response = client
        .put(url)
        .header(CONTENT_TYPE, "application/json")
        .body(data)
        .send()
        .await
        .map_err(|e| AgentError::Transfer(format!("HTTP PUT failed: {e}")))?;
    match response.status().as_u16() {
        200 | 204 => Ok(()),
        code => Err(AgentError::Transfer(format!(
            "HTTP PUT returned status {code}"
        ))),
    }
}
