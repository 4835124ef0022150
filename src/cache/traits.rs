//! Core types and trait for the response cache.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};

/// Bumped on deploys that invalidate previously cached responses.
/// Activation deletes every bucket that does not carry the current version.
pub const CACHE_VERSION: u32 = 1;

/// The two named cache buckets.
///
/// Static assets are immutable until a new version is deployed; API responses
/// are time-sensitive and carry a freshness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBucket {
  Static,
  Api,
}

impl CacheBucket {
  /// Versioned bucket name as stored on disk (e.g. "static-v1").
  pub fn name(&self) -> String {
    match self {
      Self::Static => format!("static-v{}", CACHE_VERSION),
      Self::Api => format!("api-v{}", CACHE_VERSION),
    }
  }

  /// The bucket names belonging to the current version.
  pub fn current_names() -> [String; 2] {
    [Self::Static.name(), Self::Api.name()]
  }
}

/// Cache key for a request: sha256 of method + URL, hex encoded.
/// Header variation is deliberately not part of the key.
pub fn cache_key(method: &str, url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// A cached response body with its insertion timestamp.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// Original request URL, kept verbatim for inspection.
  pub url: String,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  /// When the entry was written.
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Age of the entry relative to now.
  pub fn age(&self) -> Duration {
    Utc::now() - self.cached_at
  }
}

/// Trait for cache storage backends.
///
/// Implementations provide atomic per-key read/write; no locking beyond that
/// is assumed by callers.
pub trait CacheStore: Send + Sync {
  /// Store a response body, replacing any prior entry for the same key.
  fn put(
    &self,
    bucket: CacheBucket,
    url: &str,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()>;

  /// Look up a cached response by URL (GET is the only cached method).
  fn get(&self, bucket: CacheBucket, url: &str) -> Result<Option<CacheEntry>>;

  /// Delete every bucket whose name is not in `keep`. Returns the number of
  /// entries removed. Used at activation to prune prior-version buckets.
  fn delete_buckets_except(&self, keep: &[String]) -> Result<usize>;

  /// Names of all buckets currently holding at least one entry.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Drop every cached entry in every bucket.
  fn clear(&self) -> Result<()>;
}
