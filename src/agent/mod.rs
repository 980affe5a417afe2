//! Agent-side runtime.
//!
//! An agent holds one outbound WebSocket connection to the coordinator and
//! runs three concurrent activities over it: a heartbeat at the cadence the
//! gateway announced, a pull loop that requests work when capacity is free,
//! and the reader that routes incoming frames. Every activity writes through
//! one mutex so frames never interleave on the wire.

pub mod cache;
pub mod executor;
pub mod forward;
mod pull;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::proto::{self, envelope::Payload, Envelope, Heartbeat, JobState, Register};

use cache::InputCache;

/// Used when RegisterAck does not announce a cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Transport-level ceiling for object downloads/uploads and forward calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Slots {
    paused: bool,
    running: i32,
}

/// State shared by the reader, heartbeat, pull loop, and job executors.
pub(crate) struct AgentShared {
    config: AgentConfig,
    slots: StdMutex<Slots>,
    writer: Mutex<WsSink>,
    pull_tx: mpsc::Sender<()>,
    http: reqwest::Client,
    cache: InputCache,
}

impl AgentShared {
    fn can_accept_job(&self) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        !slots.paused && slots.running < self.config.max_concurrency
    }

    fn increment_running(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.running += 1;
    }

    fn decrement_running(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.running > 0 {
            slots.running -= 1;
        }
    }

    fn slots_snapshot(&self) -> (bool, i32) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        (slots.paused, slots.running)
    }

    /// Non-blocking nudge so the pull loop skips the rest of its backoff.
    fn signal_pull(&self) {
        let _ = self.pull_tx.try_send(());
    }

    async fn write_frame(&self, envelope: &Envelope) -> Result<(), AgentError> {
        let bytes = envelope.encode_to_vec();
        let mut writer = self.writer.lock().await;
        writer.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Reports a job status; a write failure is logged and not retried. An
    /// absent report eventually surfaces as a missing-update job.
    #[allow(clippy::too_many_arguments)]
    async fn report_status(
        &self,
        job_id: &str,
        attempt_id: i32,
        state: JobState,
        message: &str,
        output_key: &str,
        stdout: &str,
        stderr: &str,
    ) {
        let envelope = proto::envelope(
            &self.config.agent_id,
            Payload::JobStatus(proto::JobStatus {
                job_id: job_id.to_string(),
                attempt_id,
                status: state as i32,
                message: message.to_string(),
                output_key: output_key.to_string(),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
        match self.write_frame(&envelope).await {
            Ok(()) => {
                tracing::info!(job_id = %job_id, attempt_id, status = ?state, "reported job status")
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "failed to send job status")
            }
        }
    }
}

pub struct Agent;

impl Agent {
    /// Runs one connection session: connect, register, then serve the read
    /// loop until the connection drops or the token fires. Callers own the
    /// reconnect policy.
    pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
        let (ws, _) = connect_async(config.server_url.as_str()).await?;
        let (sink, mut stream) = ws.split();

        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let cache = InputCache::new(
            config.input_cache_dir.clone(),
            config.input_cache_ttl,
            http.clone(),
        );
        let (pull_tx, pull_rx) = mpsc::channel::<()>(1);

        let shared = Arc::new(AgentShared {
            config,
            slots: StdMutex::new(Slots {
                paused: false,
                running: 0,
            }),
            writer: Mutex::new(sink),
            pull_tx,
            http,
            cache,
        });

        let register = proto::envelope(
            &shared.config.agent_id,
            Payload::Register(Register {
                agent_id: shared.config.agent_id.clone(),
                agent_token: shared.config.agent_token.clone(),
                hostname: shared.config.hostname.clone(),
                max_concurrency: shared.config.max_concurrency,
            }),
        );
        shared.write_frame(&register).await?;
        tracing::info!(
            agent_id = %shared.config.agent_id,
            server_url = %shared.config.server_url,
            "connected, awaiting registration ack"
        );

        // Everything spawned for this session dies with this token.
        let session = shutdown.child_token();
        let mut pull_rx = Some(pull_rx);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                next = stream.next() => {
                    let msg = match next {
                        None => break Ok(()),
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => break Err(AgentError::Ws(e)),
                    };
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Close(_) => break Ok(()),
                        _ => continue,
                    };
                    let envelope = match Envelope::decode(data.as_slice()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to decode envelope, dropping frame");
                            continue;
                        }
                    };
                    match envelope.payload {
                        Some(Payload::RegisterAck(ack)) => {
                            if !ack.success {
                                break Err(AgentError::RegistrationRejected(ack.message));
                            }
                            let interval = if ack.heartbeat_interval_sec > 0 {
                                Duration::from_secs(ack.heartbeat_interval_sec as u64)
                            } else {
                                DEFAULT_HEARTBEAT_INTERVAL
                            };
                            // First ack starts the heartbeat and pull loop.
                            if let Some(rx) = pull_rx.take() {
                                tracing::info!(heartbeat_interval = ?interval, "registration acknowledged");
                                tokio::spawn(heartbeat_loop(shared.clone(), interval, session.clone()));
                                tokio::spawn(pull::pull_loop(shared.clone(), rx, session.clone()));
                            }
                        }
                        Some(Payload::HeartbeatAck(_)) => {
                            tracing::debug!("heartbeat acknowledged");
                        }
                        Some(Payload::JobAssigned(assigned)) => {
                            handle_job_assigned(shared.clone(), assigned).await;
                        }
                        Some(_) => {
                            tracing::debug!("unexpected agent-bound payload, dropping frame");
                        }
                        None => {
                            tracing::warn!("unknown payload tag, dropping frame");
                        }
                    }
                }
            }
        };

        session.cancel();
        result
    }
}

async fn handle_job_assigned(shared: Arc<AgentShared>, assigned: proto::JobAssigned) {
    if assigned.job_id.is_empty() {
        tracing::warn!("job_assigned missing job_id, dropping frame");
        return;
    }
    tracing::info!(
        job_id = %assigned.job_id,
        attempt_id = assigned.attempt_id,
        output_key = %assigned.output_key,
        "job assigned"
    );

    // Preflight: the gateway admitted us against its own accounting, but the
    // local count is what actually bounds concurrency.
    if !shared.can_accept_job() {
        shared
            .report_status(
                &assigned.job_id,
                assigned.attempt_id,
                JobState::Failed,
                "Agent cannot accept job (paused or at capacity)",
                "",
                "",
                "",
            )
            .await;
        return;
    }

    shared.increment_running();
    let worker = shared.clone();
    tokio::spawn(async move {
        executor::run_job(worker.clone(), assigned).await;
        worker.decrement_running();
        worker.signal_pull();
    });
}

async fn heartbeat_loop(shared: Arc<AgentShared>, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                let (paused, running_jobs) = shared.slots_snapshot();
                let envelope = proto::envelope(
                    &shared.config.agent_id,
                    Payload::Heartbeat(Heartbeat {
                        agent_id: shared.config.agent_id.clone(),
                        paused,
                        running_jobs,
                    }),
                );
                if let Err(e) = shared.write_frame(&envelope).await {
                    tracing::warn!(error = %e, "heartbeat send failed");
                    return;
                }
            }
        }
    }
}
