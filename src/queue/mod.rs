//! Durable queue of not-yet-delivered mutating requests.
//!
//! A request lands here when it fails at the network layer; it is immutable
//! once queued and is removed only after a confirmed successful replay.

mod storage;

pub use storage::{MemoryQueueStore, SqliteQueueStore};

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::net::HttpRequest;

/// Header carrying the client-generated idempotency token. Written into the
/// request's header map at capture time so replay reproduces the stored
/// header set byte-for-byte.
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// A mutating request captured for later replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
  /// Zero-padded enqueue millis plus a random suffix: sortable by insertion
  /// time without a transactional counter, collision-free across contexts.
  pub id: String,
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedRequest {
  /// Capture a failed mutating request for later replay.
  pub fn capture(request: &HttpRequest) -> Self {
    let now = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let id = format!("{:013}-{}", now.timestamp_millis(), &suffix[..8]);

    let mut headers = request.headers.clone();
    headers
      .entry(IDEMPOTENCY_HEADER.to_string())
      .or_insert_with(|| id.clone());

    Self {
      id,
      url: request.url.clone(),
      method: request.method.clone(),
      headers,
      body: request.body.clone(),
      enqueued_at: now,
    }
  }

  /// Rebuild the request for replay, method/headers/body verbatim.
  pub fn to_request(&self) -> HttpRequest {
    HttpRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Trait for queue storage backends.
pub trait QueueStore: Send + Sync {
  /// Persist a captured request. Must complete before the caller responds to
  /// the originating client.
  fn enqueue(&self, request: &QueuedRequest) -> Result<()>;

  /// All queued requests in insertion order. Malformed rows are skipped with
  /// a logged warning rather than failing the read.
  fn list(&self) -> Result<Vec<QueuedRequest>>;

  /// Remove a request after its replay was confirmed.
  fn delete(&self, id: &str) -> Result<()>;

  /// Number of requests currently queued.
  fn count(&self) -> Result<u64>;
}

#[cfg(test)]
pub(crate) mod testing {
  //! Failing backend for exercising storage-fault degradation paths.

  use super::*;
  use color_eyre::eyre::eyre;

  pub struct FailingQueueStore;

  impl QueueStore for FailingQueueStore {
    fn enqueue(&self, _request: &QueuedRequest) -> Result<()> {
      Err(eyre!("queue storage unavailable"))
    }

    fn list(&self) -> Result<Vec<QueuedRequest>> {
      Err(eyre!("queue storage unavailable"))
    }

    fn delete(&self, _id: &str) -> Result<()> {
      Err(eyre!("queue storage unavailable"))
    }

    fn count(&self) -> Result<u64> {
      Err(eyre!("queue storage unavailable"))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_capture_preserves_method_headers_and_body() {
    let request = HttpRequest::new("POST", "http://x/api/welfare")
      .with_header("content-type", "application/json")
      .with_body(r#"{"amount":500}"#);

    let queued = QueuedRequest::capture(&request);
    let replay = queued.to_request();

    assert_eq!(replay.method, "POST");
    assert_eq!(replay.url, "http://x/api/welfare");
    assert_eq!(replay.body.as_deref(), Some(r#"{"amount":500}"#));
    assert_eq!(
      replay.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
  }

  #[test]
  fn test_capture_stamps_idempotency_key_once() {
    let request = HttpRequest::new("POST", "http://x/api/a");
    let queued = QueuedRequest::capture(&request);
    assert_eq!(
      queued.headers.get(IDEMPOTENCY_HEADER),
      Some(&queued.id)
    );

    // An existing token from the caller wins.
    let request = HttpRequest::new("POST", "http://x/api/a").with_header(IDEMPOTENCY_HEADER, "mine");
    let queued = QueuedRequest::capture(&request);
    assert_eq!(
      queued.headers.get(IDEMPOTENCY_HEADER).map(String::as_str),
      Some("mine")
    );
  }

  #[test]
  fn test_ids_sort_by_enqueue_time() {
    let a = QueuedRequest::capture(&HttpRequest::new("POST", "http://x/1"));
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = QueuedRequest::capture(&HttpRequest::new("POST", "http://x/2"));
    assert!(a.id < b.id);
  }
}
