//! The offline agent: wires the interception layer, sync engine, and status
//! reporter together and runs the background triggers.
//!
//! Built as an explicitly constructed instance with injected storage and
//! network backends; nothing in here is a process-wide singleton.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheBucket, CacheStore};
use crate::config::Config;
use crate::intercept::{Classifier, Interceptor, RequestClass};
use crate::net::{HttpRequest, HttpResponse, NetworkClient};
use crate::queue::{QueueStore, QueuedRequest};
use crate::status::{probe_connectivity, StatusReporter, SubscriberId, SyncProgress, SyncStatus};
use crate::sync::{SyncEngine, SyncOutcome};

/// Control messages from the hosting application.
#[derive(Debug, Clone)]
pub enum ControlMessage {
  /// Prune prior-version cache buckets and take over immediately.
  ActivateNow,
  /// Bulk pre-cache a list of URLs into the static bucket.
  Precache(Vec<String>),
  /// Drop every cache entry belonging to this application.
  ClearCaches,
}

/// Owns the full offline subsystem for one application.
pub struct OfflineAgent<C: CacheStore, Q: QueueStore, N: NetworkClient> {
  interceptor: Interceptor<C, Q, N>,
  engine: Arc<SyncEngine<Q, N>>,
  reporter: Arc<StatusReporter>,
  cache: Arc<C>,
  queue: Arc<Q>,
  network: Arc<N>,
  config: Config,
}

impl<C: CacheStore, Q: QueueStore, N: NetworkClient> OfflineAgent<C, Q, N> {
  pub fn new(config: Config, cache: C, queue: Q, network: N) -> Self {
    let cache = Arc::new(cache);
    let queue = Arc::new(queue);
    let network = Arc::new(network);
    let reporter = Arc::new(StatusReporter::new());

    let interceptor = Interceptor::new(
      Arc::clone(&cache),
      Arc::clone(&queue),
      Arc::clone(&network),
      Classifier::from_config(&config),
    )
    .with_freshness(chrono::Duration::seconds(config.freshness_secs as i64));

    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&queue),
      Arc::clone(&network),
      Arc::clone(&reporter),
    ));

    Self {
      interceptor,
      engine,
      reporter,
      cache,
      queue,
      network,
      config,
    }
  }

  /// Serve one request through the interception layer.
  pub async fn handle(&self, request: &HttpRequest) -> HttpResponse {
    self.interceptor.handle(request).await
  }

  /// Strategy a request would be routed to, without executing it.
  pub fn classify(&self, request: &HttpRequest) -> RequestClass {
    self.interceptor.classify(request)
  }

  /// Current connectivity/queue snapshot. Never fails.
  pub fn sync_status(&self) -> SyncStatus {
    self.reporter.status(self.queue.as_ref())
  }

  /// Trigger an immediate drain pass; resolves when the pass completes.
  pub async fn force_sync_all(&self) -> Result<SyncOutcome> {
    self.engine.sync_all().await
  }

  /// Register a sync-progress observer.
  pub fn on_sync_progress<F>(&self, callback: F) -> SubscriberId
  where
    F: Fn(&SyncProgress) + Send + Sync + 'static,
  {
    self.reporter.subscribe(callback)
  }

  pub fn off_sync_progress(&self, id: SubscriberId) {
    self.reporter.unsubscribe(id);
  }

  /// Feed the connectivity signal (e.g. from an OS-level notification).
  pub fn set_online(&self, online: bool) {
    self.reporter.set_online(online);
  }

  /// Probe the configured URL once and refresh the connectivity signal.
  pub async fn probe(&self) -> Result<bool> {
    let probe_url = self
      .config
      .probe_url
      .as_deref()
      .ok_or_else(|| eyre!("No probe URL configured"))?;
    probe_connectivity(&self.reporter, self.network.as_ref(), probe_url).await
  }

  /// Snapshot of the queued requests in replay order.
  pub fn queued_requests(&self) -> Result<Vec<QueuedRequest>> {
    self.queue.list()
  }

  /// Install phase: pre-populate the static cache with the configured core
  /// assets. All-or-nothing: if any asset cannot be fetched, nothing is
  /// written and the install fails.
  pub async fn install(&self) -> Result<()> {
    self.precache(&self.config.precache).await?;
    info!(assets = self.config.precache.len(), "Install complete");
    Ok(())
  }

  /// Fetch every URL, then write every response. No partial population on
  /// fetch failure.
  pub async fn precache(&self, urls: &[String]) -> Result<()> {
    let fetches = urls.iter().map(|url| {
      let network = Arc::clone(&self.network);
      let url = url.clone();
      async move {
        let request = HttpRequest::get(&url);
        let response = network.execute(&request).await?;
        if !response.is_success() {
          return Err(eyre!("Precache fetch for {} returned {}", url, response.status));
        }
        Ok((url, response))
      }
    });

    let responses: Vec<(String, HttpResponse)> = join_all(fetches)
      .await
      .into_iter()
      .collect::<Result<_>>()?;

    for (url, response) in &responses {
      self
        .cache
        .put(
          CacheBucket::Static,
          url,
          response.content_type(),
          &response.body,
        )
        .map_err(|e| eyre!("Precache write for {} failed: {}", url, e))?;
    }

    Ok(())
  }

  /// Activation phase: delete every cache bucket from a prior version that
  /// is not one of the two current named buckets. Idempotent.
  pub fn activate(&self) -> Result<usize> {
    let removed = self
      .cache
      .delete_buckets_except(&CacheBucket::current_names())?;
    if removed > 0 {
      info!(removed, "Pruned prior-version cache entries");
    }
    Ok(removed)
  }

  pub async fn handle_control(&self, message: ControlMessage) -> Result<()> {
    match message {
      ControlMessage::ActivateNow => {
        self.activate()?;
        Ok(())
      }
      ControlMessage::Precache(urls) => self.precache(&urls).await,
      ControlMessage::ClearCaches => self.cache.clear(),
    }
  }
}

impl<C, Q, N> OfflineAgent<C, Q, N>
where
  C: CacheStore + 'static,
  Q: QueueStore + 'static,
  N: NetworkClient + 'static,
{
  /// Spawn the background triggers: periodic sync, sync-on-reconnect, and
  /// (when a probe URL is configured) the connectivity probe loop.
  ///
  /// The tasks run until aborted; they outlive any caller that navigates
  /// away, so an in-flight sync pass always completes.
  pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let agent = Arc::clone(self);
    handles.push(tokio::spawn(async move {
      let mut interval =
        tokio::time::interval(Duration::from_secs(agent.config.sync_interval_secs.max(1)));
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        if agent.reporter.is_online() {
          if let Err(e) = agent.engine.sync_all().await {
            warn!(error = %e, "Periodic sync pass failed");
          }
        }
      }
    }));

    let agent = Arc::clone(self);
    handles.push(tokio::spawn(async move {
      let mut rx = agent.reporter.watch_online();
      let mut was_online = *rx.borrow();
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online && !was_online {
          debug!("Connectivity restored, starting sync pass");
          if let Err(e) = agent.engine.sync_all().await {
            warn!(error = %e, "Reconnect sync pass failed");
          }
        }
        was_online = online;
      }
    }));

    if let Some(probe_url) = self.config.probe_url.clone() {
      let agent = Arc::clone(self);
      handles.push(tokio::spawn(async move {
        let mut interval =
          tokio::time::interval(Duration::from_secs(agent.config.probe_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
          interval.tick().await;
          if let Err(e) =
            probe_connectivity(&agent.reporter, agent.network.as_ref(), &probe_url).await
          {
            warn!(error = %e, "Connectivity probe failed");
          }
        }
      }));
    }

    handles
  }

  /// Spawn the control-message loop and hand back its sender.
  pub fn spawn_control_loop(
    self: &Arc<Self>,
  ) -> (mpsc::UnboundedSender<ControlMessage>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agent = Arc::clone(self);
    let handle = tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        if let Err(e) = agent.handle_control(message).await {
          warn!(error = %e, "Control message failed");
        }
      }
    });
    (tx, handle)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryCacheStore;
  use crate::net::testing::MockNetwork;
  use crate::queue::MemoryQueueStore;

  fn agent_with(network: MockNetwork) -> OfflineAgent<MemoryCacheStore, MemoryQueueStore, MockNetwork> {
    OfflineAgent::new(
      Config::default(),
      MemoryCacheStore::new(),
      MemoryQueueStore::new(),
      network,
    )
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let network = MockNetwork::new();
    network.respond("GET", "http://x/app.js", HttpResponse::html(200, "ok"));
    network.respond("GET", "http://x/app.css", HttpResponse::html(500, "boom"));
    let agent = agent_with(network);

    let result = agent
      .precache(&["http://x/app.js".to_string(), "http://x/app.css".to_string()])
      .await;
    assert!(result.is_err());

    // The asset that fetched fine was not written either.
    assert!(agent
      .cache
      .get(CacheBucket::Static, "http://x/app.js")
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_install_twice_leaves_exactly_current_buckets() {
    let network = MockNetwork::new();
    for _ in 0..2 {
      network.respond("GET", "http://x/app.js", HttpResponse::html(200, "ok"));
    }
    let mut config = Config::default();
    config.precache = vec!["http://x/app.js".to_string()];
    let agent = OfflineAgent::new(
      config,
      MemoryCacheStore::new(),
      MemoryQueueStore::new(),
      network,
    );

    agent.install().await.unwrap();
    agent.activate().unwrap();
    agent.install().await.unwrap();
    agent.activate().unwrap();

    let buckets = agent.cache.bucket_names().unwrap();
    assert_eq!(buckets, vec![CacheBucket::Static.name()]);
  }

  #[tokio::test]
  async fn test_clear_caches_control_message() {
    let network = MockNetwork::new();
    network.respond("GET", "http://x/app.js", HttpResponse::html(200, "ok"));
    let agent = agent_with(network);

    agent
      .precache(&["http://x/app.js".to_string()])
      .await
      .unwrap();
    agent.handle_control(ControlMessage::ClearCaches).await.unwrap();

    assert!(agent.cache.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_reconnect_triggers_automatic_sync() {
    let network = MockNetwork::new();
    network.set_online(false);
    let agent = Arc::new(agent_with(network));
    let handles = agent.spawn_background();

    // Queue a mutation while offline.
    let request = HttpRequest::new("POST", "http://x/api/a").with_body("{}");
    let response = agent.handle(&request).await;
    assert_eq!(response.status, 202);
    assert_eq!(agent.sync_status().pending_operations, 1);

    // Restore connectivity; the watcher should drain the queue.
    agent.network.set_online(true);
    agent.network.respond("POST", "http://x/api/a", HttpResponse::json(200, &serde_json::json!({})));
    agent.set_online(false);
    // Let the watcher observe the offline state before flipping back.
    tokio::time::sleep(Duration::from_millis(10)).await;
    agent.set_online(true);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.sync_status().pending_operations, 0);
    assert!(agent.sync_status().last_sync > 0);

    for handle in handles {
      handle.abort();
    }
  }

  #[tokio::test]
  async fn test_status_reflects_queue_and_connectivity() {
    let network = MockNetwork::new();
    network.set_online(false);
    let agent = agent_with(network);
    agent.set_online(false);

    agent
      .handle(&HttpRequest::new("POST", "http://x/api/a").with_body("{}"))
      .await;

    let status = agent.sync_status();
    assert!(!status.is_online);
    assert_eq!(status.pending_operations, 1);
    assert_eq!(status.last_sync, 0);
  }
}
