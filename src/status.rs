//! Connectivity and sync-state reporting.
//!
//! Observers get a pollable snapshot ([`SyncStatus`]) plus push-based
//! progress events during an active sync pass. Notification is synchronous,
//! in subscription order.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::warn;

use crate::queue::QueueStore;

/// Pollable connectivity and queue snapshot, rebuilt on demand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
  pub is_online: bool,
  pub pending_operations: u64,
  /// Millis since epoch of the last drain pass with zero failures; 0 = never.
  pub last_sync: i64,
}

/// Phase labels for progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
  Checking,
  Uploading,
  Complete,
  Error,
}

impl fmt::Display for SyncStep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Checking => "Checking",
      Self::Uploading => "Uploading",
      Self::Complete => "Complete",
      Self::Error => "Error",
    };
    write!(f, "{}", label)
  }
}

/// A progress event streamed to observers during a sync pass.
#[derive(Debug, Clone)]
pub struct SyncProgress {
  pub step: SyncStep,
  /// 0-100
  pub progress: u8,
  pub message: String,
  /// Per-request failure descriptions accumulated during the current pass.
  pub errors: Vec<String>,
}

impl SyncProgress {
  pub fn step(step: SyncStep, progress: u8, message: &str) -> Self {
    Self {
      step,
      progress,
      message: message.to_string(),
      errors: Vec::new(),
    }
  }

  pub fn with_errors(mut self, errors: Vec<String>) -> Self {
    self.errors = errors;
    self
  }
}

/// Handle returned by [`StatusReporter::subscribe`]; pass it back to
/// [`StatusReporter::unsubscribe`] to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type ProgressCallback = Box<dyn Fn(&SyncProgress) + Send + Sync>;

/// Tracks connectivity and sync state and fans progress events out to
/// registered observers.
pub struct StatusReporter {
  subscribers: Mutex<Vec<(u64, ProgressCallback)>>,
  next_id: AtomicU64,
  last_sync: AtomicI64,
  online_tx: watch::Sender<bool>,
}

impl StatusReporter {
  /// New reporter, assumed online until the first probe says otherwise.
  pub fn new() -> Self {
    let (online_tx, _) = watch::channel(true);
    Self {
      subscribers: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
      last_sync: AtomicI64::new(0),
      online_tx,
    }
  }

  /// Register a progress observer. Events arrive synchronously, in
  /// subscription order.
  pub fn subscribe<F>(&self, callback: F) -> SubscriberId
  where
    F: Fn(&SyncProgress) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.push((id, Box::new(callback)));
    }
    SubscriberId(id)
  }

  pub fn unsubscribe(&self, id: SubscriberId) {
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.retain(|(sid, _)| *sid != id.0);
    }
  }

  /// Push a progress event to every observer.
  pub fn publish(&self, progress: &SyncProgress) {
    if let Ok(subscribers) = self.subscribers.lock() {
      for (_, callback) in subscribers.iter() {
        callback(progress);
      }
    }
  }

  pub fn is_online(&self) -> bool {
    *self.online_tx.borrow()
  }

  /// Update the connectivity signal. Transitions are observable through
  /// [`StatusReporter::watch_online`].
  pub fn set_online(&self, online: bool) {
    self.online_tx.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
  }

  /// Receiver that fires on every connectivity transition.
  pub fn watch_online(&self) -> watch::Receiver<bool> {
    self.online_tx.subscribe()
  }

  /// Record a drain pass that completed with zero failures.
  pub fn mark_synced(&self) {
    self
      .last_sync
      .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
  }

  pub fn last_sync(&self) -> i64 {
    self.last_sync.load(Ordering::SeqCst)
  }

  /// Current status. Never fails: a queue-store fault degrades to a zeroed
  /// count with a logged warning.
  pub fn status<Q: QueueStore>(&self, queue: &Q) -> SyncStatus {
    match queue.count() {
      Ok(pending_operations) => SyncStatus {
        is_online: self.is_online(),
        pending_operations,
        last_sync: self.last_sync(),
      },
      Err(e) => {
        warn!(error = %e, "Queue store unavailable, reporting zeroed status");
        SyncStatus {
          is_online: self.is_online(),
          ..SyncStatus::default()
        }
      }
    }
  }
}

impl Default for StatusReporter {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for StatusReporter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StatusReporter")
      .field("last_sync", &self.last_sync())
      .field("is_online", &self.is_online())
      .finish_non_exhaustive()
  }
}

/// Probe a URL to refresh the connectivity signal.
///
/// Any response at all (even an error status) proves reachability; only a
/// transport failure marks the signal offline.
pub async fn probe_connectivity<N: crate::net::NetworkClient>(
  reporter: &StatusReporter,
  network: &N,
  probe_url: &str,
) -> Result<bool> {
  if probe_url.is_empty() {
    return Err(eyre!("Probe URL is empty"));
  }
  let request = crate::net::HttpRequest::new("HEAD", probe_url);
  let online = network.execute(&request).await.is_ok();
  reporter.set_online(online);
  Ok(online)
}
