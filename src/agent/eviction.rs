//! Size cap for the dynamic generation, enforced on a timer.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::DynamicConfig;

/// Oldest-first eviction over a generation's insertion order.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
  ceiling: usize,
  interval: Duration,
}

impl EvictionPolicy {
  pub fn new(config: &DynamicConfig) -> Self {
    Self {
      ceiling: config.max_entries,
      interval: config.evict_interval(),
    }
  }

  /// Run one pass. Returns the number of entries removed.
  ///
  /// Only entries present in the snapshot taken at the start of the pass can
  /// be removed; anything inserted afterwards survives until the next pass.
  pub fn evict_once<S: CacheStorage>(&self, storage: &S, generation: &str) -> Result<usize> {
    let victims = self.select_victims(storage, generation)?;
    self.remove(storage, generation, &victims)
  }

  /// Snapshot the generation and pick the oldest entries over the ceiling.
  fn select_victims<S: CacheStorage>(&self, storage: &S, generation: &str) -> Result<Vec<i64>> {
    let snapshot = storage.entries(generation)?;
    let overflow = snapshot.len().saturating_sub(self.ceiling);

    Ok(
      snapshot[..overflow]
        .iter()
        .map(|entry| {
          debug!(url = %entry.url, "Evicting");
          entry.seq
        })
        .collect(),
    )
  }

  fn remove<S: CacheStorage>(&self, storage: &S, generation: &str, victims: &[i64]) -> Result<usize> {
    if victims.is_empty() {
      return Ok(0);
    }
    let removed = storage.delete_entries(generation, victims)?;

    info!(generation, removed, ceiling = self.ceiling, "Evicted oldest entries");
    Ok(removed)
  }

  /// Spawn the periodic eviction task. It stops when `shutdown` flips to true
  /// or its sender is dropped.
  pub fn spawn<S: CacheStorage + 'static>(
    self,
    storage: Arc<S>,
    generation: String,
    mut shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // First tick completes immediately
      ticker.tick().await;

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if let Err(e) = self.evict_once(storage.as_ref(), &generation) {
              warn!(generation = %generation, error = %e, "Eviction pass failed");
            }
          }
          changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
              debug!("Eviction task stopping");
              break;
            }
          }
        }
      }
    })
  }
}
