//! Pull loop: a single cooperative scheduler that asks the gateway for work.
//!
//! Pacing is an exponential backoff that resets on every successful request
//! and doubles when capacity is unavailable or a send fails, whichever path
//! woke the loop. Job completion pushes a non-blocking signal into a
//! capacity-1 channel so the next pull happens within milliseconds instead
//! of a full backoff cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::proto::{self, envelope::Payload, RequestJob};

use super::{AgentError, AgentShared};

pub(crate) const MIN_BACKOFF: Duration = Duration::from_millis(500);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) async fn pull_loop(
    shared: Arc<AgentShared>,
    mut trigger: mpsc::Receiver<()>,
    token: CancellationToken,
) {
    let mut backoff = MIN_BACKOFF;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            received = trigger.recv() => {
                if received.is_none() {
                    return;
                }
                backoff = attempt_pull(&shared, backoff).await;
            }
            _ = tokio::time::sleep(backoff) => {
                backoff = attempt_pull(&shared, backoff).await;
            }
        }
    }
}

/// One pacing step, shared by the timer and the immediate trigger: grow the
/// backoff when capacity is unavailable, reset it on a successful request,
/// grow it when the send fails.
async fn attempt_pull(shared: &AgentShared, backoff: Duration) -> Duration {
    if !shared.can_accept_job() {
        return grow(backoff);
    }
    match send_request_job(shared).await {
        Ok(()) => MIN_BACKOFF,
        Err(e) => {
            tracing::warn!(error = %e, "job request failed");
            grow(backoff)
        }
    }
}

fn grow(backoff: Duration) -> Duration {
    (backoff * 2).min(MAX_BACKOFF)
}

async fn send_request_job(shared: &AgentShared) -> Result<(), AgentError> {
    let envelope = proto::envelope(
        &shared.config.agent_id,
        Payload::RequestJob(RequestJob {
            agent_id: shared.config.agent_id.clone(),
        }),
    );
    shared.write_frame(&envelope).await
}
