//! Cache storage backends: SQLite for production, in-memory for tests and
//! embedders that want a non-durable cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::traits::{cache_key, CacheBucket, CacheEntry, CacheStore};

/// Schema for the response cache. Safe to run on every startup.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    bucket TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (bucket, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_bucket ON response_cache(bucket);
"#;

/// SQLite-backed cache store.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

impl SqliteCacheStore {
  /// Open or create the cache at the given path and run migrations.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory SQLite cache, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStore for SqliteCacheStore {
  fn put(
    &self,
    bucket: CacheBucket,
    url: &str,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()> {
    let conn = self.lock()?;
    let key = cache_key("GET", url);

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (bucket, cache_key, url, content_type, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          bucket.name(),
          key,
          url,
          content_type,
          body,
          Utc::now().timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry for {}: {}", url, e))?;

    Ok(())
  }

  fn get(&self, bucket: CacheBucket, url: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;
    let key = cache_key("GET", url);

    let mut stmt = conn
      .prepare(
        "SELECT url, content_type, body, cached_at FROM response_cache
         WHERE bucket = ? AND cache_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

    let row: Option<(String, Option<String>, Vec<u8>, i64)> = stmt
      .query_row(params![bucket.name(), key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((url, content_type, body, cached_at_ms)) => Ok(Some(CacheEntry {
        url,
        content_type,
        body,
        cached_at: millis_to_datetime(cached_at_ms)?,
      })),
      None => Ok(None),
    }
  }

  fn delete_buckets_except(&self, keep: &[String]) -> Result<usize> {
    let conn = self.lock()?;

    if keep.is_empty() {
      let removed = conn
        .execute("DELETE FROM response_cache", [])
        .map_err(|e| eyre!("Failed to prune cache buckets: {}", e))?;
      return Ok(removed);
    }

    let placeholders = vec!["?"; keep.len()].join(", ");
    let sql = format!(
      "DELETE FROM response_cache WHERE bucket NOT IN ({})",
      placeholders
    );
    let removed = conn
      .execute(&sql, rusqlite::params_from_iter(keep.iter()))
      .map_err(|e| eyre!("Failed to prune cache buckets: {}", e))?;

    Ok(removed)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT bucket FROM response_cache ORDER BY bucket")
      .map_err(|e| eyre!("Failed to prepare bucket query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache buckets: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM response_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms)
    .ok_or_else(|| eyre!("Invalid cached_at timestamp: {}", ms))
}

/// In-memory cache store keyed by (bucket, cache key).
pub struct MemoryCacheStore {
  entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl MemoryCacheStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  /// Rewrite an entry's timestamp, for exercising staleness windows.
  #[cfg(test)]
  pub(crate) fn backdate(&self, bucket: CacheBucket, url: &str, age: chrono::Duration) {
    let mut entries = self.entries.lock().unwrap();
    let key = (bucket.name(), cache_key("GET", url));
    if let Some(entry) = entries.get_mut(&key) {
      entry.cached_at = Utc::now() - age;
    }
  }
}

impl Default for MemoryCacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore for MemoryCacheStore {
  fn put(
    &self,
    bucket: CacheBucket,
    url: &str,
    content_type: Option<&str>,
    body: &[u8],
  ) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    entries.insert(
      (bucket.name(), cache_key("GET", url)),
      CacheEntry {
        url: url.to_string(),
        content_type: content_type.map(String::from),
        body: body.to_vec(),
        cached_at: Utc::now(),
      },
    );

    Ok(())
  }

  fn get(&self, bucket: CacheBucket, url: &str) -> Result<Option<CacheEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(entries.get(&(bucket.name(), cache_key("GET", url))).cloned())
  }

  fn delete_buckets_except(&self, keep: &[String]) -> Result<usize> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let before = entries.len();
    entries.retain(|(bucket, _), _| keep.contains(bucket));
    Ok(before - entries.len())
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut names: Vec<String> = entries.keys().map(|(bucket, _)| bucket.clone()).collect();
    names.sort();
    names.dedup();
    Ok(names)
  }

  fn clear(&self) -> Result<()> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .clear();
    Ok(())
  }
}
