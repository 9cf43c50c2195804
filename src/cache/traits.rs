//! Core types for the generation store.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// Which lifecycle rules a generation follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
  /// Manifest snapshot, replaced wholesale per version
  Static,
  /// Grows from live traffic, size-bounded by eviction
  Dynamic,
}

impl GenerationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "static" => Some(Self::Static),
      "dynamic" => Some(Self::Dynamic),
      _ => None,
    }
  }
}

/// A named partition of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub name: String,
  pub kind: GenerationKind,
}

/// Index row of a stored entry, without the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRef {
  /// Insertion sequence, strictly increasing across the store
  pub seq: i64,
  pub url: String,
}

/// A stored response with its metadata.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub generation: String,
  pub cached_at: DateTime<Utc>,
}

/// Response handed back to the host, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: ResponseSource,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  /// Cached copy served because the network was unreachable.
  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Offline,
    }
  }

  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthesized,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from the store without a network round-trip
  Cache,
  /// Network failed, serving a stored copy
  Offline,
  /// Nothing usable; the agent built the response itself
  Synthesized,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Synthesized => "synthesized",
    }
  }
}
