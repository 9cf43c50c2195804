//! Generation store for offline content.
//!
//! This module provides:
//! - A persistent store of request → response snapshots, partitioned into
//!   named generations (static manifest snapshot, dynamic live traffic)
//! - Insertion-ordered entry indexes for FIFO eviction
//! - A durable FIFO of deferred mutation payloads
//! - Cache-first and network-first strategies with offline fallbacks

mod layer;
mod queue;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use queue::RetryStore;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, Generation, GenerationKind, ResponseSource};
