//! Deferred delivery of failed mutations, replayed on reconnect.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::RetryStore;
use crate::net::{Fetcher, Request};

/// Result of one drain trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Queue emptied
  Completed { delivered: usize },
  /// An item failed; it and everything behind it stay queued
  Aborted { delivered: usize, remaining: usize },
  /// Another drain was in progress and absorbs this trigger
  AlreadyRunning,
}

/// FIFO of failed mutations. Drains one item at a time, and at most one drain
/// runs at once.
pub struct RetryQueue<S: RetryStore> {
  store: Arc<S>,
  draining: Mutex<()>,
}

impl<S: RetryStore> RetryQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      draining: Mutex::new(()),
    }
  }

  /// Record a mutation for later delivery. Returns its queue id.
  pub fn enqueue(&self, request: &Request) -> Result<i64> {
    let seq = self.store.enqueue(request)?;
    info!(seq, url = %request.url, method = %request.method, "Queued mutation for retry");
    Ok(seq)
  }

  pub fn len(&self) -> Result<usize> {
    self.store.len()
  }

  /// Replay queued mutations oldest first.
  ///
  /// An item is removed only after a 2xx delivery. The first failure stops
  /// the drain; the next trigger resumes from that item.
  pub async fn drain(&self, fetcher: &dyn Fetcher) -> Result<DrainOutcome> {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("Drain already running");
      return Ok(DrainOutcome::AlreadyRunning);
    };

    let mut delivered = 0;
    while let Some(item) = self.store.front()? {
      self.store.record_attempt(item.seq)?;

      let failure = match fetcher.fetch(&item.request).await {
        Ok(response) if response.is_success() => None,
        Ok(response) => Some(format!("status {}", response.status)),
        Err(e) => Some(e.to_string()),
      };

      if let Some(reason) = failure {
        let remaining = self.store.len()?;
        warn!(
          seq = item.seq,
          attempts = item.attempts + 1,
          enqueued_at = %item.enqueued_at,
          remaining,
          reason = %reason,
          "Retry delivery failed, waiting for next sync"
        );
        return Ok(DrainOutcome::Aborted {
          delivered,
          remaining,
        });
      }

      self.store.remove(item.seq)?;
      delivered += 1;
      debug!(seq = item.seq, url = %item.request.url, "Delivered queued mutation");
    }

    if delivered > 0 {
      info!(delivered, "Sync completed");
    }
    Ok(DrainOutcome::Completed { delivered })
  }
}
