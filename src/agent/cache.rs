//! On-disk cache of forward-job inputs, keyed by the signed URL string.
//!
//! Forward workloads often submit bursts of jobs sharing one input (the same
//! asset analyzed with different parameters), and the signed URL is stable
//! for the signing TTL, so the URL itself is a sound cache key. With caching
//! disabled (TTL zero) every call downloads to a one-shot temp file whose
//! release guard deletes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::executor::input_extension;
use super::AgentError;

struct CacheEntry {
    path: PathBuf,
    expires_at: Instant,
}

/// Deletes a one-shot temp file when dropped; a no-op for cached files,
/// which the cache owns until their TTL expires.
#[derive(Debug)]
pub struct TempGuard(Option<PathBuf>);

impl TempGuard {
    pub fn noop() -> Self {
        Self(None)
    }

    fn removing(path: PathBuf) -> Self {
        Self(Some(path))
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub struct InputCache {
    dir: PathBuf,
    ttl: Duration,
    http: reqwest::Client,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InputCache {
    pub fn new(dir: PathBuf, ttl: Duration, http: reqwest::Client) -> Self {
        Self {
            dir,
            ttl,
            http,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a local path holding the bytes behind `url`, plus the release
    /// guard for it. Concurrent calls for the same URL may race to download;
    /// the worst case is one wasted download, never corrupted state.
    pub async fn get(&self, url: &str, input_key: &str) -> Result<(PathBuf, TempGuard), AgentError> {
        if self.ttl.is_zero() {
            let path = std::env::temp_dir().join(format!(
                "forward_input_{}{}",
                Uuid::new_v4().simple(),
                input_extension(input_key)
            ));
            download_to(&self.http, url, &path).await?;
            return Ok((path.clone(), TempGuard::removing(path)));
        }

        let now = Instant::now();
        let stale = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(url) {
                Some(entry) if entry.expires_at > now => {
                    return Ok((entry.path.clone(), TempGuard::noop()));
                }
                Some(entry) => {
                    let path = entry.path.clone();
                    entries.remove(url);
                    Some(path)
                }
                None => None,
            }
        };
        if let Some(path) = stale {
            let _ = tokio::fs::remove_file(&path).await;
            tracing::debug!(path = %path.display(), "evicted expired cache entry");
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(
            "input_{}{}",
            hex_digest(url),
            input_extension(input_key)
        ));
        download_to(&self.http, url, &path).await?;

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            url.to_string(),
            CacheEntry {
                path: path.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok((path, TempGuard::noop()))
    }
}

fn hex_digest(url: &str) -> String {
    Sha256::digest(url.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// GET `url` into `path`, requiring a 200. Partial files are removed.
pub(crate) async fn download_to(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
) -> Result<(), AgentError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AgentError::Transfer(format!("HTTP GET failed: {e}")))?;
    if response.status().as_u16() != 200 {
        return Err(AgentError::Transfer(format!(
            "HTTP GET returned status {}",
            response.status().as_u16()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AgentError::Transfer(format!("failed to read response body: {e}")))?;
    if let Err(e) = tokio::fs::write(path, &bytes).await {
        let _ = tokio::fs::remove_file(path).await;
        return Err(AgentError::Io(e));
    }
    Ok(())
}
