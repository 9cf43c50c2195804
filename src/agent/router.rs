//! Request classification and dispatch to a fetch strategy.

use reqwest::Method;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, RetryStore};
use crate::net::{Fetcher, Request, Response};

use super::retry::RetryQueue;

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not ours; the host performs the request untouched
  Passthrough,
  /// Same-origin API read
  NetworkFirst,
  /// Same-origin asset read
  CacheFirst,
  /// Same-origin state change; deferred on failure
  Mutation,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
  Passthrough,
  Respond(CacheResult),
}

pub struct Router<S: CacheStorage + RetryStore> {
  origin: Url,
  api_prefix: String,
  cache: CacheLayer<S>,
  retry: Arc<RetryQueue<S>>,
  fetcher: Arc<dyn Fetcher>,
}

impl<S: CacheStorage + RetryStore> Router<S> {
  pub fn new(
    origin: Url,
    api_prefix: String,
    cache: CacheLayer<S>,
    retry: Arc<RetryQueue<S>>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Self {
    Self {
      origin,
      api_prefix,
      cache,
      retry,
      fetcher,
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if !request.is_same_origin(&self.origin) {
      return Route::Passthrough;
    }

    if request.method != Method::GET {
      // HEAD, OPTIONS and the like change nothing worth replaying
      return if is_mutating(&request.method) {
        Route::Mutation
      } else {
        Route::Passthrough
      };
    }

    if request.url.path().starts_with(&self.api_prefix) {
      Route::NetworkFirst
    } else {
      Route::CacheFirst
    }
  }

  pub async fn handle(&self, request: &Request) -> FetchOutcome {
    let result = match self.classify(request) {
      Route::Passthrough => return FetchOutcome::Passthrough,
      Route::NetworkFirst => {
        self
          .cache
          .network_first(request, || self.fetcher.fetch(request))
          .await
      }
      Route::CacheFirst => {
        self
          .cache
          .cache_first(request, || self.fetcher.fetch(request))
          .await
      }
      Route::Mutation => self.mutate(request).await,
    };

    FetchOutcome::Respond(result)
  }

  /// Deliver a mutation, queueing it for replay if delivery fails.
  ///
  /// A server failure response is passed through to the caller; a transport
  /// failure is answered with a structured 503.
  async fn mutate(&self, request: &Request) -> CacheResult {
    match self.fetcher.fetch(request).await {
      Ok(response) if response.is_success() => CacheResult::from_network(response),
      Ok(response) => {
        warn!(url = %request.url, status = response.status, "Mutation rejected, queueing");
        if let Err(e) = self.retry.enqueue(request) {
          warn!(url = %request.url, error = %e, "Failed to queue mutation");
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Mutation failed, queueing");
        let payload = match self.retry.enqueue(request) {
          Ok(seq) => serde_json::json!({
            "error": "Network request failed; queued for background sync",
            "queued": true,
            "retry_id": seq,
          }),
          Err(e) => {
            warn!(url = %request.url, error = %e, "Failed to queue mutation");
            serde_json::json!({
              "error": "Network request failed",
              "queued": false,
            })
          }
        };
        CacheResult::synthesized(Response::json_error_with(payload))
      }
    }
  }
}

fn is_mutating(method: &Method) -> bool {
  *method == Method::POST
    || *method == Method::PUT
    || *method == Method::PATCH
    || *method == Method::DELETE
}
