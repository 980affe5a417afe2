//! FORWARD_HTTP job execution.
//!
//! Hands the job to an HTTP service on the agent host. Two input modes: URL
//! (the service fetches the signed URL itself) and LOCAL_FILE (the agent
//! downloads through the input cache and posts a multipart body). The
//! service's response body becomes the job's stdout and, when an output
//! grant exists, its uploaded output object.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Method;

use crate::proto::{InputForwardModeCode, JobAssigned, JobState};

use super::executor::{
    resolve_presigned, sanitize_output, truncate_output, upload_output, JobReport,
    OUTPUT_CAP_BYTES,
};
use super::AgentShared;

/// Response bodies above this fail the job rather than ballooning memory.
pub const MAX_FORWARD_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Bytes of the response body quoted in failure messages.
const MESSAGE_BODY_CAP: usize = 2000;

pub(crate) async fn run_forward_job(shared: Arc<AgentShared>, assigned: JobAssigned) {
    let report = forward_job(&shared, &assigned).await;
    shared
        .report_status(
            &assigned.job_id,
            assigned.attempt_id,
            report.state,
            &report.message,
            &report.output_key,
            &report.stdout,
            &report.stderr,
        )
        .await;
}

async fn forward_job(shared: &AgentShared, assigned: &JobAssigned) -> JobReport {
    let spec = match assigned.forward_http.as_ref() {
        Some(spec) if !spec.url.trim().is_empty() => spec,
        _ => return JobReport::failed("forward_http.url is required"),
    };
    let target_url = spec.url.trim();

    let method_raw = spec.method.trim().to_ascii_uppercase();
    let method = if method_raw.is_empty() {
        Method::POST
    } else {
        match Method::from_bytes(method_raw.as_bytes()) {
            Ok(method) => method,
            Err(_) => return JobReport::failed(format!("Invalid forward method: {method_raw}")),
        }
    };

    let mut input_url = match assigned.input_access.as_ref() {
        None => String::new(),
        Some(access) => match resolve_presigned(Some(access), "input_access") {
            Ok(url) => url,
            Err(message) => return JobReport::failed(message),
        },
    };
    if assigned.input_key.is_empty() {
        input_url.clear();
    }

    let mode = match InputForwardModeCode::try_from(assigned.input_forward_mode) {
        Ok(InputForwardModeCode::Unspecified) | Err(_) => InputForwardModeCode::Url,
        Ok(mode) => mode,
    };

    let mut headers = HeaderMap::new();
    for pair in &spec.headers {
        if pair.key.is_empty() {
            continue;
        }
        match (
            HeaderName::from_bytes(pair.key.as_bytes()),
            HeaderValue::from_str(&pair.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => {
                tracing::warn!(key = %pair.key, "skipping invalid forward header");
            }
        }
    }
    insert_header(&mut headers, "x-job-id", &assigned.job_id);
    insert_header(&mut headers, "x-attempt-id", &assigned.attempt_id.to_string());

    let request = if mode == InputForwardModeCode::LocalFile && !input_url.is_empty() {
        let (path, guard) = match shared.cache.get(&input_url, &assigned.input_key).await {
            Ok(cached) => cached,
            Err(e) => return JobReport::failed(format!("Download failed: {e}")),
        };
        let file_bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => return JobReport::failed(format!("Open input failed: {e}")),
        };
        // One-shot temp files can go as soon as the bytes are in memory.
        drop(guard);

        let file_name = if assigned.input_key.is_empty() {
            base_name(&path.display().to_string())
        } else {
            base_name(&assigned.input_key)
        };
        let mut form = Form::new().part("file", Part::bytes(file_bytes).file_name(file_name));
        if !spec.body.is_empty() {
            form = form.text("payload", String::from_utf8_lossy(&spec.body).into_owned());
        }
        if !assigned.input_key.is_empty() {
            form = form.text("input_key", assigned.input_key.clone());
        }
        form = form.text("input_url", input_url.clone());

        shared
            .http
            .request(method, target_url)
            .headers(headers)
            .multipart(form)
    } else {
        let mut body = spec.body.clone();
        if body.is_empty() && !input_url.is_empty() {
            // The service gets a reference to fetch instead of raw bytes.
            body = serde_json::json!({
                "input_url": input_url,
                "input_key": assigned.input_key,
            })
            .to_string()
            .into_bytes();
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }
        if !input_url.is_empty() {
            insert_header(&mut headers, "x-input-url", &input_url);
            if !assigned.input_key.is_empty() {
                insert_header(&mut headers, "x-input-key", &assigned.input_key);
            }
        }
        shared
            .http
            .request(method, target_url)
            .headers(headers)
            .body(body)
    };

    let request = if spec.timeout_sec > 0 {
        request.timeout(Duration::from_secs(spec.timeout_sec as u64))
    } else {
        request
    };

    let mut response = match request.send().await {
        Ok(response) => response,
        Err(e) => return JobReport::failed(format!("Forward request failed: {e}")),
    };
    let status = response.status();

    let mut body_bytes: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                body_bytes.extend_from_slice(&chunk);
                if body_bytes.len() > MAX_FORWARD_RESPONSE_BYTES {
                    return JobReport::failed("Response body too large");
                }
            }
            Ok(None) => break,
            Err(e) => return JobReport::failed(format!("Read response failed: {e}")),
        }
    }

    if !status.is_success() {
        let mut message = format!("Forward HTTP returned status {}", status.as_u16());
        if !body_bytes.is_empty() {
            message = format!(
                "{}: {}",
                message,
                truncate_output(&sanitize_output(&body_bytes), MESSAGE_BODY_CAP)
            );
        }
        return JobReport::failed(message);
    }

    let mut output_key_to_report = String::new();
    if !body_bytes.is_empty() && assigned.output_access.is_some() {
        let url = match resolve_presigned(assigned.output_access.as_ref(), "output_access") {
            Ok(url) => url,
            Err(message) => return JobReport::failed(message),
        };
        if let Err(e) = upload_output(&shared.http, &url, body_bytes.clone()).await {
            return JobReport::failed(format!("Upload failed: {e}"));
        }
        output_key_to_report = assigned.output_key.clone();
    }

    JobReport {
        state: JobState::Succeeded,
        message: String::new(),
        output_key: output_key_to_report,
        stdout: truncate_output(&sanitize_output(&body_bytes), OUTPUT_CAP_BYTES),
        stderr: String::new(),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => {
            tracing::warn!(header = name, "skipping header with invalid value");
        }
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("input")
        .to_string()
}
