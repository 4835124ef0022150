//! Drains the mutation queue against the live network.
//!
//! At-least-once delivery: an entry is deleted only after a confirmed 2xx
//! replay, one at a time, in insertion order. A failing entry is left for the
//! next pass and never blocks the entries behind it. Only one drain pass runs
//! at a time; triggers arriving mid-pass coalesce into a single follow-up.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::net::NetworkClient;
use crate::queue::QueueStore;
use crate::status::{StatusReporter, SyncProgress, SyncStep};

/// Result of a drain pass.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
  /// Entries confirmed delivered and removed from the queue.
  pub synced: usize,
  /// Entries that failed replay and remain queued.
  pub failed: usize,
  /// Per-request failure descriptions, in replay order.
  pub errors: Vec<String>,
}

/// Background replay engine for the mutation queue.
pub struct SyncEngine<Q: QueueStore, N: NetworkClient> {
  queue: Arc<Q>,
  network: Arc<N>,
  reporter: Arc<StatusReporter>,
  drain_lock: tokio::sync::Mutex<()>,
  rerun: AtomicBool,
  /// Result of the most recent pass, handed to coalesced callers. A
  /// pass-fatal failure is recorded too so no trigger mistakes it for
  /// success.
  last_outcome: std::sync::Mutex<Result<SyncOutcome, String>>,
}

impl<Q: QueueStore, N: NetworkClient> SyncEngine<Q, N> {
  pub fn new(queue: Arc<Q>, network: Arc<N>, reporter: Arc<StatusReporter>) -> Self {
    Self {
      queue,
      network,
      reporter,
      drain_lock: tokio::sync::Mutex::new(()),
      rerun: AtomicBool::new(false),
      last_outcome: std::sync::Mutex::new(Ok(SyncOutcome::default())),
    }
  }

  /// Run a drain pass, or coalesce into the one already running.
  ///
  /// Resolves when a pass covering this trigger has completed (success or
  /// partial failure); fails only when the queue store itself is unreadable.
  pub async fn sync_all(&self) -> Result<SyncOutcome> {
    match self.drain_lock.try_lock() {
      Ok(_guard) => {
        let mut result = self.drain().await;
        // Triggers that arrived mid-pass get exactly one follow-up pass; a
        // pass-fatal failure answers them too rather than retrying blind.
        while result.is_ok() && self.rerun.swap(false, Ordering::SeqCst) {
          result = self.drain().await;
        }
        if result.is_err() {
          self.rerun.store(false, Ordering::SeqCst);
        }
        if let Ok(mut last) = self.last_outcome.lock() {
          *last = match &result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(e.to_string()),
          };
        }
        result
      }
      Err(_) => {
        self.rerun.store(true, Ordering::SeqCst);
        // Wait for the active pass (plus its follow-up) to finish.
        let _wait = self.drain_lock.lock().await;
        match self.last_outcome.lock() {
          Ok(last) => match &*last {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(eyre!("Sync pass failed: {}", e)),
          },
          Err(e) => Err(eyre!("Lock poisoned: {}", e)),
        }
      }
    }
  }

  /// One complete attempt to replay every currently queued request.
  async fn drain(&self) -> Result<SyncOutcome> {
    self
      .reporter
      .publish(&SyncProgress::step(SyncStep::Checking, 0, "Reading sync queue"));

    let entries = match self.queue.list() {
      Ok(entries) => entries,
      Err(e) => {
        // Pass-fatal: nothing can be replayed if the queue is unreadable.
        self.reporter.publish(
          &SyncProgress::step(SyncStep::Error, 100, "Sync queue unreadable")
            .with_errors(vec![e.to_string()]),
        );
        return Err(e);
      }
    };

    let total = entries.len();
    if total == 0 {
      self.reporter.mark_synced();
      self
        .reporter
        .publish(&SyncProgress::step(SyncStep::Complete, 100, "Nothing to sync"));
      return Ok(SyncOutcome::default());
    }

    let mut synced = 0;
    let mut errors = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
      let request = entry.to_request();
      match self.network.execute(&request).await {
        Ok(response) if response.is_success() => {
          // Delete immediately, not batched: an interruption mid-pass can
          // lose at most the in-flight entry's confirmation.
          match self.queue.delete(&entry.id) {
            Ok(()) => {
              debug!(id = %entry.id, "Replayed and dequeued");
              synced += 1;
            }
            Err(e) => {
              warn!(id = %entry.id, error = %e, "Delivered but not dequeued, will replay again");
              errors.push(format!("{}: delivered but not dequeued: {}", entry.id, e));
            }
          }
        }
        Ok(response) => {
          warn!(id = %entry.id, status = response.status, "Replay rejected by server");
          errors.push(format!(
            "{} {}: server returned {}",
            entry.method, entry.url, response.status
          ));
        }
        Err(e) => {
          debug!(id = %entry.id, error = %e, "Replay failed, keeping entry");
          errors.push(format!("{} {}: {}", entry.method, entry.url, e));
        }
      }

      let progress = (10 + (index + 1) * 80 / total) as u8;
      self.reporter.publish(
        &SyncProgress::step(
          SyncStep::Uploading,
          progress,
          &format!("Replayed {} of {}", index + 1, total),
        )
        .with_errors(errors.clone()),
      );
    }

    let failed = errors.len();
    if failed == 0 {
      self.reporter.mark_synced();
    }
    self.reporter.publish(
      &SyncProgress::step(
        SyncStep::Complete,
        100,
        &format!("Synced {} of {}", synced, total),
      )
      .with_errors(errors.clone()),
    );

    Ok(SyncOutcome {
      synced,
      failed,
      errors,
    })
  }
}
