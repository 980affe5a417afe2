use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use edgelink::api::ApiState;
use edgelink::config::{ServerConfig, StorageConfig};
use edgelink::gateway::Gateway;
use edgelink::job::{JobStore, MemoryJobStore, SqliteJobStore};
use edgelink::queue::InMemoryQueue;
use edgelink::registry::AgentRegistry;
use edgelink::server;
use edgelink::shutdown::install_shutdown_handler;
use edgelink::storage::StaticUrlSigner;

#[derive(Parser, Debug)]
#[command(name = "edgelinkd")]
#[command(about = "Cloud-to-edge compute dispatch coordinator")]
struct Args {
    /// Address to serve the HTTP API and agent WebSocket endpoint on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path of the agent WebSocket endpoint
    #[arg(long, default_value = "/ws")]
    ws_path: String,

    /// SQLite database path; omit to keep jobs in memory
    #[arg(long)]
    db: Option<PathBuf>,

    /// Development mode: accept any agent token
    #[arg(long)]
    dev: bool,

    /// Object-store endpoint for signed URLs (overrides EDGELINK_STORAGE_URL)
    #[arg(long)]
    storage_url: Option<String>,

    /// Default object-store bucket (overrides EDGELINK_STORAGE_BUCKET)
    #[arg(long)]
    storage_bucket: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut storage = StorageConfig::from_env();
    if let Some(url) = args.storage_url {
        storage.base_url = url;
    }
    if let Some(bucket) = args.storage_bucket {
        storage.bucket = bucket;
    }

    let config = ServerConfig {
        listen_addr: args.listen,
        ws_path: args.ws_path,
        db_path: args.db,
        dev_mode: args.dev,
        storage,
    };

    let store: Arc<dyn JobStore> = match &config.db_path {
        Some(path) => {
            let store = SqliteJobStore::open(path)?;
            tracing::info!(path = %path.display(), "sqlite job store initialized");
            Arc::new(store)
        }
        None => {
            tracing::info!("in-memory job store initialized");
            Arc::new(MemoryJobStore::new())
        }
    };
    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(AgentRegistry::new());
    let signer = Arc::new(
        StaticUrlSigner::new(&config.storage.base_url, &config.storage.bucket)
            .with_ttl_secs(config.storage.presign_ttl.as_secs()),
    );

    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        store.clone(),
        queue.clone(),
        signer,
        config.dev_mode,
    ));
    let api_state = ApiState {
        registry,
        store,
        queue,
    };

    tracing::info!(
        listen = %config.listen_addr,
        ws_path = %config.ws_path,
        dev_mode = config.dev_mode,
        storage_url = %config.storage.base_url,
        "starting edgelinkd"
    );

    let router = server::build_router(api_state, gateway, &config.ws_path);
    let shutdown = install_shutdown_handler();
    server::serve(config.listen_addr, router, shutdown).await?;
    Ok(())
}
