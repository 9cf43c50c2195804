//! Request and response snapshots exchanged between the host, the store and the network.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// An intercepted content request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Request {
  /// A bodiless GET, as issued for manifest and preload entries.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  /// Stable identity of this request inside a generation.
  ///
  /// Two requests with the same method and full locator map to the same entry.
  pub fn entry_key(&self) -> String {
    entry_key(&self.method, &self.url)
  }

  /// Whether this request targets the given origin.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

/// SHA256 over `METHOD url`, hex encoded.
pub fn entry_key(method: &Method, url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

/// A response snapshot: status line, headers and full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: canonical_reason(status).to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only plain 200 responses are ever written to the store.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  /// Synthesized 503 with a structured JSON error body.
  pub fn json_error(message: &str) -> Self {
    Self::json_error_with(serde_json::json!({ "error": message }))
  }

  pub fn json_error_with(payload: serde_json::Value) -> Self {
    Self::new(503, payload.to_string()).with_header("Content-Type", "application/json")
  }

  /// Synthesized plain-text 503 used when an asset is unavailable offline.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("Content-Type", "text/plain")
  }
}

fn canonical_reason(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
