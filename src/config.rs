use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Object-store endpoint the signer targets.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_url: String,
    pub bucket: String,
    pub presign_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            bucket: "edgelink".to_string(),
            presign_ttl: Duration::from_secs(crate::storage::DEFAULT_PRESIGN_TTL_SECS),
        }
    }
}

impl StorageConfig {
    /// Environment overrides: EDGELINK_STORAGE_URL, EDGELINK_STORAGE_BUCKET,
    /// EDGELINK_PRESIGN_TTL_SEC.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("EDGELINK_STORAGE_URL") {
            if !url.is_empty() {
                cfg.base_url = url;
            }
        }
        if let Ok(bucket) = std::env::var("EDGELINK_STORAGE_BUCKET") {
            if !bucket.is_empty() {
                cfg.bucket = bucket;
            }
        }
        if let Ok(ttl) = std::env::var("EDGELINK_PRESIGN_TTL_SEC") {
            if let Ok(secs) = ttl.parse::<u64>() {
                cfg.presign_ttl = Duration::from_secs(secs);
            }
        }
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    /// None keeps jobs in memory.
    pub db_path: Option<PathBuf>,
    pub dev_mode: bool,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().expect("static addr"),
            ws_path: "/ws".to_string(),
            db_path: None,
            dev_mode: false,
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub agent_id: String,
    pub agent_token: String,
    pub hostname: String,
    pub max_concurrency: i32,
    /// Zero disables the forward-input cache.
    pub input_cache_ttl: Duration,
    pub input_cache_dir: PathBuf,
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            agent_id: agent_id.into(),
            agent_token: String::new(),
            hostname: default_hostname(),
            max_concurrency: 1,
            input_cache_ttl: Duration::from_secs(10 * 60),
            input_cache_dir: std::env::temp_dir().join("edgelink-input-cache"),
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
