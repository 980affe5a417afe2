use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use edgelink::agent::Agent;
use edgelink::config::AgentConfig;
use edgelink::shutdown::install_shutdown_handler;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "edgelink-agent")]
#[command(about = "Edge worker agent for the edgelink dispatch bridge")]
struct Args {
    /// Coordinator WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    server_url: String,

    /// Stable agent identity; generated when omitted
    #[arg(long)]
    agent_id: Option<String>,

    /// Registration token (validated outside dev mode)
    #[arg(long, default_value = "")]
    agent_token: String,

    /// Maximum concurrent jobs
    #[arg(long, default_value_t = 1)]
    max_concurrency: i32,

    /// Forward-input cache TTL in seconds; 0 disables caching
    #[arg(long, default_value_t = 600)]
    cache_ttl_sec: u64,

    /// Forward-input cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let agent_id = args
        .agent_id
        .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4().simple()));
    let mut config = AgentConfig::new(args.server_url, agent_id);
    config.agent_token = args.agent_token;
    config.max_concurrency = args.max_concurrency.max(1);
    config.input_cache_ttl = Duration::from_secs(args.cache_ttl_sec);
    if let Some(dir) = args.cache_dir {
        config.input_cache_dir = dir;
    }

    let shutdown = install_shutdown_handler();

    // The agent lives behind NAT; it dials out and keeps dialing until told
    // to stop.
    loop {
        match Agent::run(config.clone(), shutdown.clone()).await {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    tracing::info!("agent stopped");
                    return;
                }
                tracing::warn!("connection closed, reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, "agent session ended, reconnecting");
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("agent stopped");
                return;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
