//! Queue storage backends: SQLite for production, in-memory for tests.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use super::{QueueStore, QueuedRequest};

/// Schema for the sync queue, version 1. Safe to run on every startup.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_enqueued ON sync_queue(enqueued_at);
"#;

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

impl SqliteQueueStore {
  /// Open or create the queue at the given path and run migrations.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory SQLite queue, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl QueueStore for SqliteQueueStore {
  fn enqueue(&self, request: &QueuedRequest) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (id, url, method, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          request.id,
          request.url,
          request.method,
          headers,
          request.body,
          request.enqueued_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue request {}: {}", request.id, e))?;

    Ok(())
  }

  fn list(&self) -> Result<Vec<QueuedRequest>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, enqueued_at FROM sync_queue
         ORDER BY enqueued_at, id",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, String, String, String, Option<String>, i64)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut requests = Vec::with_capacity(rows.len());
    for (id, url, method, headers, body, enqueued_ms) in rows {
      let headers = match serde_json::from_str(&headers) {
        Ok(map) => map,
        Err(e) => {
          warn!(id = %id, error = %e, "Skipping queued request with unreadable headers");
          continue;
        }
      };
      let enqueued_at = match DateTime::<Utc>::from_timestamp_millis(enqueued_ms) {
        Some(ts) => ts,
        None => {
          warn!(id = %id, enqueued_ms, "Skipping queued request with invalid timestamp");
          continue;
        }
      };
      requests.push(QueuedRequest {
        id,
        url,
        method,
        headers,
        body,
        enqueued_at,
      });
    }

    Ok(requests)
  }

  fn delete(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued request {}: {}", id, e))?;
    Ok(())
  }

  fn count(&self) -> Result<u64> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count sync queue: {}", e))?;
    Ok(count as u64)
  }
}

/// In-memory queue store; insertion order is the vector order.
pub struct MemoryQueueStore {
  requests: Mutex<Vec<QueuedRequest>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self {
      requests: Mutex::new(Vec::new()),
    }
  }
}

impl Default for MemoryQueueStore {
  fn default() -> Self {
    Self::new()
  }
}

impl QueueStore for MemoryQueueStore {
  fn enqueue(&self, request: &QueuedRequest) -> Result<()> {
    self
      .requests
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(request.clone());
    Ok(())
  }

  fn list(&self) -> Result<Vec<QueuedRequest>> {
    Ok(
      self
        .requests
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .clone(),
    )
  }

  fn delete(&self, id: &str) -> Result<()> {
    self
      .requests
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .retain(|r| r.id != id);
    Ok(())
  }

  fn count(&self) -> Result<u64> {
    Ok(
      self
        .requests
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .len() as u64,
    )
  }
}
