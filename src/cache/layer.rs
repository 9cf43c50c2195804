//! Cache layer that orchestrates the two fetch strategies over the store.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::net::{Request, Response};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedResponse, Generation};

/// Cache layer that manages the store and network fallbacks.
///
/// Successful network responses are copied into the dynamic generation;
/// lookups search every generation. Store failures degrade to a miss.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  dynamic: Generation,
  /// Served when an asset is missing and the network is down
  offline_page: Option<Request>,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>, dynamic: Generation) -> Self {
    Self {
      storage,
      dynamic,
      offline_page: None,
    }
  }

  pub fn with_offline_page(mut self, page: Option<Request>) -> Self {
    self.offline_page = page;
    self
  }

  /// Look up a stored response. Read failures count as a miss.
  pub fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    match self.storage.match_any(request) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Store read failed, treating as miss");
        None
      }
    }
  }

  /// Copy a response into the dynamic generation if it is cacheable.
  fn store_copy(&self, request: &Request, response: &Response) {
    if !response.is_cacheable() {
      debug!(url = %request.url, status = response.status, "Not caching response");
      return;
    }

    if let Err(e) = self.storage.put(&self.dynamic, request, response) {
      warn!(url = %request.url, error = %e, "Failed to store response");
    }
  }

  /// Serve with cache-first strategy.
  ///
  /// 1. Any stored copy is returned immediately, no network round-trip
  /// 2. Otherwise fetch, storing a copy on success
  /// 3. If both fail, serve the offline page or a synthesized 503
  pub async fn cache_first<F, Fut>(&self, request: &Request, fetcher: F) -> CacheResult
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    if let Some(hit) = self.lookup(request) {
      debug!(
        url = %request.url,
        generation = %hit.generation,
        cached_at = %hit.cached_at,
        "Serving from cache"
      );
      return CacheResult::from_cache(hit.response);
    }

    debug!(url = %request.url, "Fetching from network");
    match fetcher().await {
      Ok(response) => {
        self.store_copy(request, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Fetch failed");

        let offline = self
          .offline_page
          .as_ref()
          .and_then(|page| self.lookup(page));

        match offline {
          Some(page) => CacheResult::offline(page.response),
          None => CacheResult::synthesized(Response::offline()),
        }
      }
    }
  }

  /// Serve with network-first strategy.
  ///
  /// 1. Fetch, storing a copy on success
  /// 2. On network failure, return any stored copy
  /// 3. Otherwise a structured 503 error
  pub async fn network_first<F, Fut>(&self, request: &Request, fetcher: F) -> CacheResult
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    debug!(url = %request.url, "Network first");
    match fetcher().await {
      Ok(response) => {
        self.store_copy(request, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");

        match self.lookup(request) {
          Some(hit) => CacheResult::offline(hit.response),
          None => CacheResult::synthesized(Response::json_error(
            "Network request failed and no cache available",
          )),
        }
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      dynamic: self.dynamic.clone(),
      offline_page: self.offline_page.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::{GenerationKind, ResponseSource};
  use crate::cache::SqliteStorage;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use url::Url;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  fn dynamic() -> Generation {
    Generation {
      name: "learnmate-dynamic".to_string(),
      kind: GenerationKind::Dynamic,
    }
  }

  fn layer() -> (Arc<SqliteStorage>, CacheLayer<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let layer = CacheLayer::new(Arc::clone(&storage), dynamic())
      .with_offline_page(Some(get("/offline.html")));
    (storage, layer)
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let (storage, layer) = layer();
    let statics = Generation {
      name: "learnmate-v1".to_string(),
      kind: GenerationKind::Static,
    };
    storage
      .put(&statics, &get("/js/app.js"), &Response::new(200, "cached"))
      .unwrap();

    let calls = AtomicU32::new(0);
    let result = layer
      .cache_first(&get("/js/app.js"), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, color_eyre::Report>(Response::new(200, "fresh"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.body, b"cached");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_populates_dynamic() {
    let (storage, layer) = layer();

    let result = layer
      .cache_first(&get("/img/map.png"), || async {
        Ok::<_, color_eyre::Report>(Response::new(200, "png"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Network);
    let stored = storage
      .match_in("learnmate-dynamic", &get("/img/map.png"))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"png");
  }

  #[tokio::test]
  async fn test_error_responses_are_not_stored() {
    let (storage, layer) = layer();

    let result = layer
      .cache_first(&get("/missing.css"), || async {
        Ok::<_, color_eyre::Report>(Response::new(404, "nope"))
      })
      .await;
    assert_eq!(result.response.status, 404);

    layer
      .network_first(&get("/api/lessons"), || async {
        Ok::<_, color_eyre::Report>(Response::new(500, "boom"))
      })
      .await;

    assert!(storage.entries("learnmate-dynamic").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unreadable_entry_is_a_miss() {
    let (storage, layer) = layer();
    storage
      .put(&dynamic(), &get("/css/styles.css"), &Response::new(200, "stale"))
      .unwrap();
    storage
      .conn()
      .unwrap()
      .execute("UPDATE entries SET headers = 'not json'", [])
      .unwrap();
    assert!(storage.match_any(&get("/css/styles.css")).is_err());

    let calls = AtomicU32::new(0);
    let result = layer
      .cache_first(&get("/css/styles.css"), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, color_eyre::Report>(Response::new(200, "fresh"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = storage
      .match_in("learnmate-dynamic", &get("/css/styles.css"))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_cache_first_offline_page_fallback() {
    let (storage, layer) = layer();
    storage
      .put(&dynamic(), &get("/offline.html"), &Response::new(200, "<h1>offline</h1>"))
      .unwrap();

    let result = layer
      .cache_first(&get("/lesson/3.html"), || async {
        Err::<Response, _>(eyre!("offline"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Offline);
    assert_eq!(result.response.body, b"<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_cache_first_synthesizes_503() {
    let (_storage, layer) = layer();

    let result = layer
      .cache_first(&get("/lesson/3.html"), || async {
        Err::<Response, _>(eyre!("offline"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Synthesized);
    assert_eq!(result.response.status, 503);
    assert_eq!(result.response.status_text, "Service Unavailable");
  }

  #[tokio::test]
  async fn test_network_first_success_updates_cache() {
    let (storage, layer) = layer();
    storage
      .put(&dynamic(), &get("/api/lessons"), &Response::new(200, "old"))
      .unwrap();

    let result = layer
      .network_first(&get("/api/lessons"), || async {
        Ok::<_, color_eyre::Report>(Response::new(200, "new"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"new");
    let stored = storage
      .match_in("learnmate-dynamic", &get("/api/lessons"))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"new");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let (storage, layer) = layer();
    storage
      .put(&dynamic(), &get("/api/lessons"), &Response::new(200, "cached"))
      .unwrap();

    let result = layer
      .network_first(&get("/api/lessons"), || async {
        Err::<Response, _>(eyre!("offline"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Offline);
    assert_eq!(result.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_structured_error() {
    let (_storage, layer) = layer();

    let result = layer
      .network_first(&get("/api/lessons"), || async {
        Err::<Response, _>(eyre!("offline"))
      })
      .await;

    assert_eq!(result.source, ResponseSource::Synthesized);
    assert_eq!(result.response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&result.response.body).unwrap();
    assert_eq!(body["error"], "Network request failed and no cache available");
  }
}
