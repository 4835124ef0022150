//! Request interception: classify every outgoing request and serve it
//! through the strategy its class demands.
//!
//! Callers never see an error from [`Interceptor::handle`]; every internal
//! failure degrades to a cached entry or a well-formed synthetic response.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheBucket, CacheEntry, CacheStore};
use crate::config::Config;
use crate::net::{HttpRequest, HttpResponse, NetworkClient};
use crate::queue::{QueueStore, QueuedRequest};

/// Annotation headers added to responses served from cache.
pub const HDR_CACHE: &str = "x-offline-cache";
pub const HDR_STALE: &str = "x-offline-stale";
pub const HDR_CACHED_AT: &str = "x-offline-cached-at";

/// Offline placeholder served when a navigation has no cached page.
/// Offers a manual retry and polls connectivity until the origin answers.
const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available offline. It will load as soon as the connection returns.</p>
<button onclick="location.reload()">Retry</button>
<script>
setInterval(function () {
  fetch(location.href, { method: 'HEAD' }).then(function () { location.reload(); }).catch(function () {});
}, 5000);
</script>
</body>
</html>
"#;

/// How a request will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Non-GET: pass through, queue on network failure.
  Mutation,
  /// Immutable build artifact: cache-first.
  StaticAsset,
  /// Cacheable API response: network-first with stale fallback.
  Api,
  /// Navigation: network-first with offline-page fallback.
  Page,
}

/// Deterministic request classifier driven by the configured tables.
#[derive(Debug, Clone)]
pub struct Classifier {
  static_suffixes: Vec<String>,
  api_prefixes: Vec<String>,
}

impl Classifier {
  pub fn from_config(config: &Config) -> Self {
    Self {
      static_suffixes: config.static_suffixes.clone(),
      api_prefixes: config.api_prefixes.clone(),
    }
  }

  /// Classification rules, evaluated in order: mutation, static suffix,
  /// API prefix, page.
  pub fn classify(&self, request: &HttpRequest) -> RequestClass {
    if request.is_mutation() {
      return RequestClass::Mutation;
    }

    let path = Url::parse(&request.url)
      .map(|u| u.path().to_string())
      .unwrap_or_else(|_| request.url.clone());
    let path = path.to_lowercase();

    if self.static_suffixes.iter().any(|s| path.ends_with(s)) {
      return RequestClass::StaticAsset;
    }
    if self.api_prefixes.iter().any(|p| path.starts_with(p)) {
      return RequestClass::Api;
    }
    RequestClass::Page
  }
}

/// The interception layer: one entry point, four strategies.
pub struct Interceptor<C: CacheStore, Q: QueueStore, N: NetworkClient> {
  cache: Arc<C>,
  queue: Arc<Q>,
  network: Arc<N>,
  classifier: Classifier,
  /// How long an API cache entry stays fresh.
  freshness: Duration,
}

impl<C: CacheStore, Q: QueueStore, N: NetworkClient> Interceptor<C, Q, N> {
  pub fn new(cache: Arc<C>, queue: Arc<Q>, network: Arc<N>, classifier: Classifier) -> Self {
    Self {
      cache,
      queue,
      network,
      classifier,
      freshness: Duration::minutes(5),
    }
  }

  /// Set the freshness window for cached API responses.
  pub fn with_freshness(mut self, freshness: Duration) -> Self {
    self.freshness = freshness;
    self
  }

  pub fn classify(&self, request: &HttpRequest) -> RequestClass {
    self.classifier.classify(request)
  }

  /// Serve a request. Infallible by contract: the caller always receives a
  /// well-formed response, queued-accepted marker, or structured fallback.
  pub async fn handle(&self, request: &HttpRequest) -> HttpResponse {
    // HEAD probes pass straight through: not a mutation, so never queued,
    // and only GET responses may enter the cache.
    if request.method == "HEAD" {
      return self.pass_through(request).await;
    }
    match self.classifier.classify(request) {
      RequestClass::Mutation => self.mutation(request).await,
      RequestClass::StaticAsset => self.cache_first(request).await,
      RequestClass::Api => self.network_first_api(request).await,
      RequestClass::Page => self.network_first_page(request).await,
    }
  }

  /// Cache-first: serve the cached asset if present, otherwise fetch and
  /// store. An uncached asset with no network yields a 404-equivalent.
  async fn cache_first(&self, request: &HttpRequest) -> HttpResponse {
    match self.cache.get(CacheBucket::Static, &request.url) {
      Ok(Some(entry)) => serve_cached(entry, false),
      Ok(None) => self.fetch_and_cache(request, CacheBucket::Static).await.unwrap_or_else(|| {
        HttpResponse::json(
          404,
          &serde_json::json!({
            "error": "not_cached",
            "message": "Asset unavailable offline",
          }),
        )
      }),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache read failed, falling back to network");
        self.fetch_and_cache(request, CacheBucket::Static).await.unwrap_or_else(|| {
          HttpResponse::json(404, &serde_json::json!({"error": "not_cached"}))
        })
      }
    }
  }

  /// Network-first for API requests: a fresh response is cached and
  /// returned; on network failure the cached entry is served, flagged stale
  /// past the freshness window; with no cache a structured 503 comes back.
  async fn network_first_api(&self, request: &HttpRequest) -> HttpResponse {
    match self.network.execute(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(request, CacheBucket::Api, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "API fetch failed, trying cache");
        match self.cache.get(CacheBucket::Api, &request.url) {
          Ok(Some(entry)) => {
            let stale = entry.age() > self.freshness;
            serve_cached(entry, stale)
          }
          Ok(None) => HttpResponse::json(
            503,
            &serde_json::json!({
              "error": "offline",
              "message": "No cached data available for this request",
            }),
          ),
          Err(e) => {
            warn!(url = %request.url, error = %e, "Cache read failed while offline");
            HttpResponse::json(503, &serde_json::json!({"error": "offline"}))
          }
        }
      }
    }
  }

  /// Network-first for navigations: cache successful pages, fall back to the
  /// cached copy, then to the built-in offline placeholder.
  async fn network_first_page(&self, request: &HttpRequest) -> HttpResponse {
    match self.network.execute(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(request, CacheBucket::Static, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Page fetch failed, trying cache");
        match self.cache.get(CacheBucket::Static, &request.url) {
          Ok(Some(entry)) => serve_cached(entry, false),
          Ok(None) => HttpResponse::html(503, OFFLINE_PAGE),
          Err(e) => {
            warn!(url = %request.url, error = %e, "Cache read failed while offline");
            HttpResponse::html(503, OFFLINE_PAGE)
          }
        }
      }
    }
  }

  /// Mutation path: try the network; on failure persist the request to the
  /// queue *before* answering 202 so the write is never fire-and-forget.
  async fn mutation(&self, request: &HttpRequest) -> HttpResponse {
    match self.network.execute(request).await {
      Ok(response) => response,
      Err(network_err) => {
        let queued = QueuedRequest::capture(request);
        match self.queue.enqueue(&queued) {
          Ok(()) => {
            debug!(id = %queued.id, url = %request.url, "Queued mutating request for sync");
            HttpResponse::json(
              202,
              &serde_json::json!({
                "queued": true,
                "id": queued.id,
                "message": "Request stored and will sync when connectivity returns",
              }),
            )
          }
          Err(storage_err) => {
            // Persistence failed: report the original failure, not a fake 202.
            warn!(
              url = %request.url,
              error = %storage_err,
              "Failed to queue mutating request"
            );
            HttpResponse::json(
              502,
              &serde_json::json!({
                "queued": false,
                "error": "offline",
                "message": format!("{}", network_err),
              }),
            )
          }
        }
      }
    }
  }

  /// Forward a request untouched; the cache and queue are never involved.
  async fn pass_through(&self, request: &HttpRequest) -> HttpResponse {
    match self.network.execute(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Pass-through fetch failed");
        HttpResponse::json(503, &serde_json::json!({"error": "offline"}))
      }
    }
  }

  /// Fetch from network and cache a successful response. Returns None when
  /// the network is unreachable.
  async fn fetch_and_cache(
    &self,
    request: &HttpRequest,
    bucket: CacheBucket,
  ) -> Option<HttpResponse> {
    match self.network.execute(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(request, bucket, &response);
        }
        Some(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network fetch failed");
        None
      }
    }
  }

  /// Cache a response body; a write failure degrades to serve-without-caching.
  fn store(&self, request: &HttpRequest, bucket: CacheBucket, response: &HttpResponse) {
    // Cache entries are GET responses; the cache key assumes it.
    if request.method != "GET" {
      return;
    }
    if let Err(e) = self.cache.put(
      bucket,
      &request.url,
      response.content_type(),
      &response.body,
    ) {
      warn!(url = %request.url, error = %e, "Cache write failed, serving uncached");
    }
  }
}

/// Turn a cache entry into a response, annotated with its origin and age.
fn serve_cached(entry: CacheEntry, stale: bool) -> HttpResponse {
  let mut response = HttpResponse {
    status: 200,
    headers: Default::default(),
    body: entry.body,
  };
  if let Some(content_type) = entry.content_type {
    response.headers.insert("content-type".to_string(), content_type);
  }
  response.headers.insert(HDR_CACHE.to_string(), "hit".to_string());
  response.headers.insert(
    HDR_CACHED_AT.to_string(),
    entry.cached_at.timestamp_millis().to_string(),
  );
  if stale {
    response.headers.insert(HDR_STALE.to_string(), "true".to_string());
  }
  response
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryCacheStore;
  use crate::net::testing::MockNetwork;
  use crate::queue::MemoryQueueStore;

  fn interceptor(
    network: Arc<MockNetwork>,
  ) -> (
    Interceptor<MemoryCacheStore, MemoryQueueStore, MockNetwork>,
    Arc<MemoryCacheStore>,
    Arc<MemoryQueueStore>,
  ) {
    let cache = Arc::new(MemoryCacheStore::new());
    let queue = Arc::new(MemoryQueueStore::new());
    let classifier = Classifier::from_config(&Config::default());
    let interceptor = Interceptor::new(
      Arc::clone(&cache),
      Arc::clone(&queue),
      network,
      classifier,
    );
    (interceptor, cache, queue)
  }

  #[test]
  fn test_classification_is_deterministic() {
    let classifier = Classifier::from_config(&Config::default());

    let cases = [
      ("POST", "http://x/api/welfare", RequestClass::Mutation),
      ("GET", "http://x/assets/app.js", RequestClass::StaticAsset),
      ("GET", "http://x/api/members", RequestClass::Api),
      ("GET", "http://x/dashboard", RequestClass::Page),
    ];
    for (method, url, expected) in cases {
      let request = HttpRequest::new(method, url);
      for _ in 0..3 {
        assert_eq!(classifier.classify(&request), expected, "{} {}", method, url);
      }
    }
  }

  #[test]
  fn test_static_suffix_wins_over_api_prefix_order() {
    // Non-GET beats everything, including an API-prefixed URL.
    let classifier = Classifier::from_config(&Config::default());
    let request = HttpRequest::new("DELETE", "http://x/api/members/1");
    assert_eq!(classifier.classify(&request), RequestClass::Mutation);

    // Suffix rule is checked before the prefix rule.
    let request = HttpRequest::get("http://x/api/report.css");
    assert_eq!(classifier.classify(&request), RequestClass::StaticAsset);
  }

  #[tokio::test]
  async fn test_api_response_is_cached_and_returned_unchanged() {
    let network = Arc::new(MockNetwork::new());
    network.respond(
      "GET",
      "http://x/api/members",
      HttpResponse::json(200, &serde_json::json!([{"id": 1}])),
    );
    let (interceptor, cache, _) = interceptor(Arc::clone(&network));

    let request = HttpRequest::get("http://x/api/members");
    let response = interceptor.handle(&request).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), r#"[{"id":1}]"#);

    let entry = cache
      .get(CacheBucket::Api, "http://x/api/members")
      .unwrap()
      .expect("response should be cached");
    assert_eq!(entry.body, response.body);
  }

  #[tokio::test]
  async fn test_offline_api_serves_cache_with_freshness_annotation() {
    let network = Arc::new(MockNetwork::new());
    network.respond(
      "GET",
      "http://x/api/members",
      HttpResponse::json(200, &serde_json::json!([1])),
    );
    let (interceptor, cache, _) = interceptor(Arc::clone(&network));
    let request = HttpRequest::get("http://x/api/members");

    // Populate the cache online, then cut the network.
    interceptor.handle(&request).await;
    network.set_online(false);

    // Four minutes old: served, not stale.
    cache.backdate(CacheBucket::Api, "http://x/api/members", Duration::minutes(4));
    let response = interceptor.handle(&request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header(HDR_CACHE), Some("hit"));
    assert_eq!(response.header(HDR_STALE), None);

    // Six minutes old: still served, flagged stale.
    cache.backdate(CacheBucket::Api, "http://x/api/members", Duration::minutes(6));
    let response = interceptor.handle(&request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header(HDR_STALE), Some("true"));
  }

  #[tokio::test]
  async fn test_offline_api_without_cache_returns_structured_503() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let (interceptor, _, _) = interceptor(network);

    let response = interceptor.handle(&HttpRequest::get("http://x/api/none")).await;
    assert_eq!(response.status, 503);
    assert!(response.body_text().contains("\"error\":\"offline\""));
  }

  #[tokio::test]
  async fn test_static_asset_served_from_cache_without_network() {
    let network = Arc::new(MockNetwork::new());
    network.respond("GET", "http://x/app.js", HttpResponse::html(200, "console.log(1)"));
    let (interceptor, _, _) = interceptor(Arc::clone(&network));
    let request = HttpRequest::get("http://x/app.js");

    interceptor.handle(&request).await;
    network.set_online(false);

    let response = interceptor.handle(&request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header(HDR_CACHE), Some("hit"));
    assert_eq!(response.body_text(), "console.log(1)");
    // Cache-first: the second request never touched the network.
    assert_eq!(network.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_uncached_static_asset_offline_yields_404() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let (interceptor, _, _) = interceptor(network);

    let response = interceptor.handle(&HttpRequest::get("http://x/missing.js")).await;
    assert_eq!(response.status, 404);
  }

  #[tokio::test]
  async fn test_offline_navigation_falls_back_to_placeholder_page() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let (interceptor, _, _) = interceptor(network);

    let response = interceptor.handle(&HttpRequest::get("http://x/dashboard")).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));
    assert!(response.body_text().contains("You are offline"));
  }

  #[tokio::test]
  async fn test_offline_navigation_prefers_cached_page() {
    let network = Arc::new(MockNetwork::new());
    network.respond("GET", "http://x/dashboard", HttpResponse::html(200, "<h1>Dash</h1>"));
    let (interceptor, _, _) = interceptor(Arc::clone(&network));
    let request = HttpRequest::get("http://x/dashboard");

    interceptor.handle(&request).await;
    network.set_online(false);

    let response = interceptor.handle(&request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "<h1>Dash</h1>");
  }

  #[tokio::test]
  async fn test_head_does_not_overwrite_cached_get_body() {
    let network = Arc::new(MockNetwork::new());
    network.respond("GET", "http://x/dashboard", HttpResponse::html(200, "<h1>Dash</h1>"));
    network.respond("HEAD", "http://x/dashboard", HttpResponse::html(200, ""));
    let (interceptor, _, _) = interceptor(Arc::clone(&network));

    // Populate the cache, then send a HEAD probe to the same URL.
    interceptor.handle(&HttpRequest::get("http://x/dashboard")).await;
    let head = interceptor
      .handle(&HttpRequest::new("HEAD", "http://x/dashboard"))
      .await;
    assert_eq!(head.status, 200);

    // The cached GET body must survive the empty-bodied HEAD response.
    network.set_online(false);
    let response = interceptor.handle(&HttpRequest::get("http://x/dashboard")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "<h1>Dash</h1>");
  }

  #[tokio::test]
  async fn test_head_offline_is_neither_queued_nor_cached() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let (interceptor, cache, queue) = interceptor(network);

    let response = interceptor
      .handle(&HttpRequest::new("HEAD", "http://x/api/members"))
      .await;

    assert_eq!(response.status, 503);
    assert_eq!(queue.count().unwrap(), 0);
    assert!(cache.get(CacheBucket::Api, "http://x/api/members").unwrap().is_none());
    assert!(cache.get(CacheBucket::Static, "http://x/api/members").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_failed_mutation_is_queued_and_acknowledged() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let (interceptor, _, queue) = interceptor(network);

    let request = HttpRequest::new("POST", "http://x/api/welfare")
      .with_header("content-type", "application/json")
      .with_body(r#"{"amount":500}"#);
    let response = interceptor.handle(&request).await;

    assert_eq!(response.status, 202);
    assert!(response.body_text().contains("\"queued\":true"));

    let entries = queue.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].body.as_deref(), Some(r#"{"amount":500}"#));
    assert_eq!(entries[0].method, "POST");
  }

  #[tokio::test]
  async fn test_successful_mutation_passes_through_unqueued() {
    let network = Arc::new(MockNetwork::new());
    network.respond(
      "POST",
      "http://x/api/welfare",
      HttpResponse::json(201, &serde_json::json!({"id": 9})),
    );
    let (interceptor, _, queue) = interceptor(network);

    let request = HttpRequest::new("POST", "http://x/api/welfare").with_body("{}");
    let response = interceptor.handle(&request).await;

    assert_eq!(response.status, 201);
    assert_eq!(queue.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_queue_persistence_failure_surfaces_original_error() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let cache = Arc::new(MemoryCacheStore::new());
    let queue = Arc::new(crate::queue::testing::FailingQueueStore);
    let classifier = Classifier::from_config(&Config::default());
    let interceptor = Interceptor::new(cache, queue, network, classifier);

    let response = interceptor
      .handle(&HttpRequest::new("POST", "http://x/api/a").with_body("{}"))
      .await;

    assert_eq!(response.status, 502);
    assert!(response.body_text().contains("\"queued\":false"));
  }
}
