//! Signed-URL generation for the out-of-band data plane.
//!
//! The coordinator never proxies payload bytes; it hands agents short-lived
//! URLs that support a bare HTTP GET or PUT. Production deployments plug a
//! cloud object-store driver into [`StorageSigner`]; the in-tree
//! [`StaticUrlSigner`] targets S3-compatible endpoints that accept
//! unauthenticated access (local dev stores, test stubs) and only stamps an
//! expiry onto the URL.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::SignerError;

/// Default lifetime of generated URLs: 15 minutes.
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 15 * 60;

#[async_trait]
pub trait StorageSigner: Send + Sync {
    /// A URL supporting a bare HTTP GET of `bucket/key`.
    async fn signed_download(&self, bucket: &str, key: &str) -> Result<String, SignerError>;

    /// A URL supporting a bare HTTP PUT of `bucket/key`.
    async fn signed_upload(&self, bucket: &str, key: &str) -> Result<String, SignerError>;
}

pub struct StaticUrlSigner {
    base_url: String,
    default_bucket: String,
    ttl_secs: u64,
}

impl StaticUrlSigner {
    pub fn new(base_url: impl Into<String>, default_bucket: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_bucket: default_bucket.into(),
            ttl_secs: DEFAULT_PRESIGN_TTL_SECS,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn build(&self, bucket: &str, key: &str) -> Result<String, SignerError> {
        if key.is_empty() {
            return Err(SignerError::EmptyKey);
        }
        let bucket = if bucket.is_empty() {
            &self.default_bucket
        } else {
            bucket
        };
        if bucket.is_empty() {
            return Err(SignerError::MissingBucket);
        }
        // Expiry is quantized to the TTL window so repeated signings of the
        // same object yield the same URL while the window lasts. Agents key
        // their input cache on the URL string, and bursts of jobs sharing an
        // input rely on it staying stable. Remaining validity is between one
        // and two TTLs.
        let window = self.ttl_secs.max(1) as i64;
        let expires = (Utc::now().timestamp() / window + 2) * window;
        Ok(format!(
            "{}/{}/{}?expires={}",
            self.base_url, bucket, key, expires
        ))
    }
}

#[async_trait]
impl StorageSigner for StaticUrlSigner {
    async fn signed_download(&self, bucket: &str, key: &str) -> Result<String, SignerError> {
        self.build(bucket, key)
    }

    async fn signed_upload(&self, bucket: &str, key: &str) -> Result<String, SignerError> {
        self.build(bucket, key)
    }
}
