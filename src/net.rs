//! HTTP request/response descriptors and the network client seam.
//!
//! Everything above this module speaks in terms of [`HttpRequest`] and
//! [`HttpResponse`] so the network backend can be swapped (reqwest in
//! production, a scripted mock in tests).

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// An outgoing HTTP request, flattened to the fields the queue persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
  /// Uppercase method name ("GET", "POST", ...)
  pub method: String,
  pub url: String,
  /// Flattened header map. Header variation is not part of any cache key.
  pub headers: BTreeMap<String, String>,
  /// Body text, if any. Stored and replayed verbatim.
  pub body: Option<String>,
}

impl HttpRequest {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_uppercase(),
      url: url.to_string(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: &str) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: &str) -> Self {
    self.body = Some(body.to_string());
    self
  }

  /// Whether this request mutates server state and must never be cached.
  pub fn is_mutation(&self) -> bool {
    !matches!(self.method.as_str(), "GET" | "HEAD")
  }
}

/// A response as seen by callers of the interception layer.
///
/// Synthetic responses (queued-accepted, offline fallbacks) are built through
/// the constructors below so they always carry a content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Build a synthetic JSON response.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status,
      headers,
      body: value.to_string().into_bytes(),
    }
  }

  /// Build a synthetic HTML response.
  pub fn html(status: u16, body: &str) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert(
      "content-type".to_string(),
      "text/html; charset=utf-8".to_string(),
    );
    Self {
      status,
      headers,
      body: body.as_bytes().to_vec(),
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Trait for network backends.
///
/// The returned future must be `Send` so the sync engine can replay requests
/// from spawned background tasks.
pub trait NetworkClient: Send + Sync {
  fn execute(
    &self,
    request: &HttpRequest,
  ) -> impl Future<Output = Result<HttpResponse>> + Send;
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct ReqwestClient {
  client: reqwest::Client,
}

impl ReqwestClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl NetworkClient for ReqwestClient {
  fn execute(
    &self,
    request: &HttpRequest,
  ) -> impl Future<Output = Result<HttpResponse>> + Send {
    async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| eyre!("Invalid HTTP method {}: {}", request.method, e))?;

      let mut builder = self.client.request(method, &request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
        .to_vec();

      Ok(HttpResponse {
        status,
        headers,
        body,
      })
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mutation_classification() {
    assert!(!HttpRequest::get("http://x/a").is_mutation());
    assert!(!HttpRequest::new("head", "http://x/a").is_mutation());
    assert!(HttpRequest::new("post", "http://x/a").is_mutation());
    assert!(HttpRequest::new("DELETE", "http://x/a").is_mutation());
  }

  #[test]
  fn test_synthetic_json_response() {
    let response = HttpResponse::json(202, &serde_json::json!({"queued": true}));
    assert_eq!(response.status, 202);
    assert_eq!(response.content_type(), Some("application/json"));
    assert!(response.body_text().contains("\"queued\":true"));
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let request = HttpRequest::get("http://x/a").with_header("X-Custom", "1");
    assert_eq!(request.headers.get("x-custom").map(String::as_str), Some("1"));
  }
}
