//! Duplex gateway for agent connections.
//!
//! Agents dial in over WebSocket (they live behind NAT, so every connection
//! is outbound-initiated) and exchange protobuf envelopes. Each accepted
//! socket runs two activities: a writer draining a bounded send buffer and a
//! read loop that decodes envelopes and dispatches to handlers. Handling is
//! sequential per connection, which serializes admission decisions for a
//! given agent without extra locking.

mod dispatch;
mod reconcile;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::sync::mpsc;

use crate::job::JobStore;
use crate::proto::{self, envelope::Payload, Envelope, HeartbeatAck, RegisterAck};
use crate::queue::PendingQueue;
use crate::registry::AgentRegistry;
use crate::storage::StorageSigner;

/// Frames buffered per connection before overflow closes it.
pub const SEND_BUFFER_FRAMES: usize = 256;

/// Heartbeat cadence announced to agents in RegisterAck.
pub const HEARTBEAT_INTERVAL_SECS: u32 = 20;

pub struct Gateway {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn PendingQueue>,
    signer: Arc<dyn StorageSigner>,
    connections: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    dev_mode: bool,
    agent_tokens: RwLock<HashMap<String, String>>,
}

/// Returned by handlers to tear the connection down (send-buffer overflow,
/// rejected registration, protocol violations that poison the stream).
pub(crate) struct CloseConnection;

/// Per-connection state owned by the read loop.
pub(crate) struct ConnCtx {
    pub(crate) agent_id: Option<String>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ConnCtx {
    /// Enqueues a frame on the send buffer. A full buffer is fatal for the
    /// connection: dropping frames silently would desynchronize the agent.
    pub(crate) fn send(&self, envelope: &Envelope) -> Result<(), CloseConnection> {
        let bytes = envelope.encode_to_vec();
        self.tx.try_send(bytes).map_err(|e| {
            tracing::warn!(error = %e, "send buffer unavailable, closing connection");
            CloseConnection
        })
    }
}

impl Gateway {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn PendingQueue>,
        signer: Arc<dyn StorageSigner>,
        dev_mode: bool,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            signer,
            connections: RwLock::new(HashMap::new()),
            dev_mode,
            agent_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Installs a token for an agent id. Outside dev mode, registration is
    /// rejected unless the presented token matches an installed one.
    pub fn set_agent_token(&self, agent_id: &str, token: &str) {
        let mut tokens = self.agent_tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(agent_id.to_string(), token.to_string());
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SEND_BUFFER_FRAMES);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        });

        let mut ctx = ConnCtx { agent_id: None, tx };

        while let Some(next) = stream.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket read error");
                    break;
                }
            };
            match msg {
                Message::Binary(data) => {
                    let envelope = match Envelope::decode(data.as_slice()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to decode envelope, dropping frame");
                            continue;
                        }
                    };
                    if self.handle_envelope(&mut ctx, envelope).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Text(_) => {
                    tracing::warn!("unexpected text frame, dropping");
                }
            }
        }

        if let Some(agent_id) = ctx.agent_id.take() {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.remove(&agent_id);
            drop(connections);
            self.registry.unregister(&agent_id);
            tracing::info!(agent_id = %agent_id, "agent disconnected");
        }
        writer.abort();
    }

    async fn handle_envelope(
        &self,
        ctx: &mut ConnCtx,
        envelope: Envelope,
    ) -> Result<(), CloseConnection> {
        let payload = match &envelope.payload {
            Some(payload) => payload.clone(),
            None => {
                tracing::warn!(agent_id = %envelope.agent_id, "unknown payload tag, dropping frame");
                return Ok(());
            }
        };

        // Envelope identity and payload identity must agree.
        if let Some(embedded) = proto::payload_agent_id(&payload) {
            if !envelope.agent_id.is_empty()
                && !embedded.is_empty()
                && envelope.agent_id != embedded
            {
                tracing::warn!(
                    envelope_agent_id = %envelope.agent_id,
                    payload_agent_id = %embedded,
                    "agent_id mismatch between envelope and payload, dropping frame"
                );
                return Ok(());
            }
        }

        match payload {
            Payload::Register(register) => self.handle_register(ctx, &envelope, register),
            Payload::Heartbeat(heartbeat) => self.handle_heartbeat(ctx, &envelope, heartbeat),
            Payload::RequestJob(request) => {
                self.handle_request_job(ctx, &envelope, request).await
            }
            Payload::JobStatus(status) => self.handle_job_status(ctx, &envelope, status).await,
            _ => {
                tracing::warn!(agent_id = %envelope.agent_id, "unexpected gateway-bound payload, dropping frame");
                Ok(())
            }
        }
    }

    fn handle_register(
        &self,
        ctx: &mut ConnCtx,
        envelope: &Envelope,
        register: proto::Register,
    ) -> Result<(), CloseConnection> {
        let agent_id = register.agent_id.clone();
        if agent_id.is_empty() {
            tracing::warn!("register missing agent_id, dropping frame");
            return Ok(());
        }

        if !self.validate_token(&agent_id, &register.agent_token) {
            tracing::warn!(agent_id = %agent_id, "registration rejected: invalid token");
            let ack = proto::reply(
                &envelope.request_id,
                Payload::RegisterAck(RegisterAck {
                    success: false,
                    message: "invalid agent token".to_string(),
                    heartbeat_interval_sec: 0,
                }),
            );
            // Deliver the rejection, then close either way.
            let _ = ctx.send(&ack);
            return Err(CloseConnection);
        }

        ctx.agent_id = Some(agent_id.clone());
        {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.insert(agent_id.clone(), ctx.tx.clone());
        }
        self.registry
            .register(&agent_id, &register.hostname, register.max_concurrency);
        tracing::info!(
            agent_id = %agent_id,
            hostname = %register.hostname,
            max_concurrency = register.max_concurrency,
            "agent registered"
        );

        let ack = proto::reply(
            &envelope.request_id,
            Payload::RegisterAck(RegisterAck {
                success: true,
                message: "registered".to_string(),
                heartbeat_interval_sec: HEARTBEAT_INTERVAL_SECS,
            }),
        );
        ctx.send(&ack)
    }

    fn handle_heartbeat(
        &self,
        ctx: &ConnCtx,
        envelope: &Envelope,
        heartbeat: proto::Heartbeat,
    ) -> Result<(), CloseConnection> {
        let bound = match &ctx.agent_id {
            Some(bound) => bound,
            None => {
                tracing::warn!("heartbeat from unregistered connection, dropping frame");
                return Ok(());
            }
        };
        if heartbeat.agent_id != *bound {
            tracing::warn!(
                bound_agent_id = %bound,
                payload_agent_id = %heartbeat.agent_id,
                "heartbeat agent_id mismatch, dropping frame"
            );
            return Ok(());
        }

        self.registry
            .update_heartbeat(&heartbeat.agent_id, heartbeat.paused, heartbeat.running_jobs);

        let ack = proto::reply(
            &envelope.request_id,
            Payload::HeartbeatAck(HeartbeatAck { success: true }),
        );
        ctx.send(&ack)
    }

    fn validate_token(&self, agent_id: &str, token: &str) -> bool {
        // Policy hook. Dev mode accepts any token; production deployments
        // install expected tokens via set_agent_token.
        if self.dev_mode {
            return true;
        }
        let tokens = self.agent_tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens.get(agent_id).map(|t| t == token).unwrap_or(false)
    }
}

/// Axum handler for the duplex endpoint; upgrades and hands the socket to
/// the gateway.
pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway.handle_socket(socket))
}
