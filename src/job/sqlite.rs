//! Durable job store backed by SQLite.
//!
//! Row access happens behind a single async mutex, which gives every
//! operation (including the read-validate-write in `update_status`) one
//! critical section without an explicit transaction.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::job::model::{ForwardSpec, InputForwardMode, Job, JobStatus, JobType};
use crate::job::store::JobStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    job_type TEXT NOT NULL DEFAULT 'COMMAND',
    input_bucket TEXT NOT NULL DEFAULT '',
    input_key TEXT NOT NULL DEFAULT '',
    output_bucket TEXT NOT NULL DEFAULT '',
    output_key TEXT NOT NULL DEFAULT '',
    output_prefix TEXT NOT NULL DEFAULT '',
    output_extension TEXT NOT NULL DEFAULT 'bin',
    attempt_id INTEGER NOT NULL DEFAULT 1,
    assigned_agent_id TEXT NOT NULL DEFAULT '',
    lease_id TEXT NOT NULL DEFAULT '',
    lease_deadline TEXT,
    command TEXT NOT NULL DEFAULT '',
    forward_url TEXT NOT NULL DEFAULT '',
    forward_method TEXT NOT NULL DEFAULT '',
    forward_headers TEXT NOT NULL DEFAULT '',
    forward_body TEXT NOT NULL DEFAULT '',
    forward_timeout INTEGER NOT NULL DEFAULT 0,
    input_forward_mode TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL DEFAULT '',
    stdout TEXT NOT NULL DEFAULT '',
    stderr TEXT NOT NULL DEFAULT '',
    CHECK (attempt_id >= 1),
    CHECK (status IN ('PENDING', 'ASSIGNED', 'RUNNING', 'SUCCEEDED', 'FAILED', 'CANCELED', 'LOST'))
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_assigned_agent ON jobs(assigned_agent_id);
"#;

const JOB_COLUMNS: &str = "job_id, created_at, status, job_type, input_bucket, input_key, \
     output_bucket, output_key, output_prefix, output_extension, attempt_id, \
     assigned_agent_id, lease_id, lease_deadline, command, forward_url, forward_method, \
     forward_headers, forward_body, forward_timeout, input_forward_mode, message, stdout, stderr";

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_locked(conn: &Connection, job_id: &str) -> Result<Job, StoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS);
        conn.query_row(&sql, params![job_id], row_to_job)
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?
    }

    fn touch(conn: &Connection, job_id: &str, affected: usize) -> Result<(), StoreError> {
        if affected == 0 {
            // UPDATE matched no row; distinguish from a silent no-op.
            Self::get_locked(conn, job_id).map(|_| ())
        } else {
            Ok(())
        }
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw}: {e}")))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let created_at_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let job_type_raw: String = row.get(3)?;
    let lease_deadline_raw: Option<String> = row.get(13)?;
    let forward_url: String = row.get(15)?;
    let forward_method: String = row.get(16)?;
    let forward_headers_raw: String = row.get(17)?;
    let forward_body: String = row.get(18)?;
    let forward_timeout: i64 = row.get(19)?;
    let input_forward_raw: String = row.get(20)?;

    let build = || -> Result<Job, StoreError> {
        let headers = if forward_headers_raw.is_empty() {
            Default::default()
        } else {
            serde_json::from_str(&forward_headers_raw)
                .map_err(|e| StoreError::Backend(format!("bad forward_headers: {e}")))?
        };
        let forward = if forward_url.is_empty() {
            None
        } else {
            Some(ForwardSpec {
                url: forward_url.clone(),
                method: forward_method.clone(),
                headers,
                body: forward_body.clone(),
                timeout_sec: forward_timeout as u32,
            })
        };
        Ok(Job {
            job_id: row.get(0).map_err(|e| StoreError::Backend(e.to_string()))?,
            created_at: parse_timestamp(&created_at_raw)?,
            status: status_raw.parse::<JobStatus>()?,
            job_type: job_type_raw.parse::<JobType>()?,
            input_bucket: row.get(4).map_err(|e| StoreError::Backend(e.to_string()))?,
            input_key: row.get(5).map_err(|e| StoreError::Backend(e.to_string()))?,
            output_bucket: row.get(6).map_err(|e| StoreError::Backend(e.to_string()))?,
            output_key: row.get(7).map_err(|e| StoreError::Backend(e.to_string()))?,
            output_prefix: row.get(8).map_err(|e| StoreError::Backend(e.to_string()))?,
            output_extension: row.get(9).map_err(|e| StoreError::Backend(e.to_string()))?,
            attempt_id: row.get(10).map_err(|e| StoreError::Backend(e.to_string()))?,
            assigned_agent_id: row.get(11).map_err(|e| StoreError::Backend(e.to_string()))?,
            lease_id: row.get(12).map_err(|e| StoreError::Backend(e.to_string()))?,
            lease_deadline: lease_deadline_raw
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            command: row.get(14).map_err(|e| StoreError::Backend(e.to_string()))?,
            forward,
            input_forward_mode: input_forward_raw.parse::<InputForwardMode>()?,
            message: row.get(21).map_err(|e| StoreError::Backend(e.to_string()))?,
            stdout: row.get(22).map_err(|e| StoreError::Backend(e.to_string()))?,
            stderr: row.get(23).map_err(|e| StoreError::Backend(e.to_string()))?,
        })
    };
    Ok(build())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        job.validate()?;
        let mut record = job.clone();
        record.normalize_output_layout();

        let forward_headers = match &record.forward {
            Some(spec) if !spec.headers.is_empty() => serde_json::to_string(&spec.headers)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            _ => String::new(),
        };
        let (forward_url, forward_method, forward_body, forward_timeout) = match &record.forward {
            Some(spec) => (
                spec.url.clone(),
                spec.method.clone(),
                spec.body.clone(),
                spec.timeout_sec as i64,
            ),
            None => (String::new(), String::new(), String::new(), 0),
        };

        let conn = self.conn.lock().await;
        let result = conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                JOB_COLUMNS
            ),
            params![
                record.job_id,
                record.created_at.to_rfc3339(),
                record.status.to_string(),
                record.job_type.to_string(),
                record.input_bucket,
                record.input_key,
                record.output_bucket,
                record.output_key,
                record.output_prefix,
                record.output_extension,
                record.attempt_id,
                record.assigned_agent_id,
                record.lease_id,
                record.lease_deadline.map(|d| d.to_rfc3339()),
                record.command,
                forward_url,
                forward_method,
                forward_headers,
                forward_body,
                forward_timeout,
                record.input_forward_mode.to_string(),
                record.message,
                record.stdout,
                record.stderr,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(format!(
                    "job {} already exists",
                    record.job_id
                )))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let conn = self.conn.lock().await;
        Self::get_locked(&conn, job_id)
    }

    async fn update_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let job = Self::get_locked(&conn, job_id)?;
        if !job.status.can_transition_to(target) {
            return Err(StoreError::InvalidTransition {
                from: job.status,
                to: target,
            });
        }
        conn.execute(
            "UPDATE jobs SET status = ?1 WHERE job_id = ?2",
            params![target.to_string(), job_id],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn update_assignment(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_id: &str,
        lease_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET assigned_agent_id = ?1, lease_id = ?2, lease_deadline = ?3 \
                 WHERE job_id = ?4",
                params![
                    agent_id,
                    lease_id,
                    lease_deadline.map(|d| d.to_rfc3339()),
                    job_id
                ],
            )
            .map_err(backend)?;
        Self::touch(&conn, job_id, affected)
    }

    async fn update_output(
        &self,
        job_id: &str,
        output_key: &str,
        output_prefix: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET output_key = ?1, output_prefix = ?2 WHERE job_id = ?3",
                params![output_key, output_prefix, job_id],
            )
            .map_err(backend)?;
        Self::touch(&conn, job_id, affected)
    }

    async fn update_attempt_id(&self, job_id: &str, attempt_id: i32) -> Result<(), StoreError> {
        if attempt_id < 1 {
            return Err(StoreError::InvalidJob("attempt_id must be >= 1".into()));
        }
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET attempt_id = ?1 WHERE job_id = ?2",
                params![attempt_id, job_id],
            )
            .map_err(backend)?;
        Self::touch(&conn, job_id, affected)
    }

    async fn update_stdout_stderr(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET stdout = ?1, stderr = ?2 WHERE job_id = ?3",
                params![stdout, stderr, job_id],
            )
            .map_err(backend)?;
        Self::touch(&conn, job_id, affected)
    }

    async fn update_message(&self, job_id: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET message = ?1 WHERE job_id = ?2",
                params![message, job_id],
            )
            .map_err(backend)?;
        Self::touch(&conn, job_id, affected)
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let mut sql = format!("SELECT {} FROM jobs", JOB_COLUMNS);
        if status.is_some() {
            sql.push_str(" WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3");
        } else {
            sql.push_str(" ORDER BY created_at DESC LIMIT ?1 OFFSET ?2");
        }

        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = match status {
            Some(s) => stmt
                .query_map(
                    params![s.to_string(), limit as i64, offset as i64],
                    row_to_job,
                )
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>(),
            None => stmt
                .query_map(params![limit as i64, offset as i64], row_to_job)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>(),
        }
        .map_err(backend)?;

        rows.into_iter().collect()
    }
}
