//! Network side of the agent: request/response snapshots and the outbound fetcher.

mod client;
mod types;

#[cfg(test)]
pub use client::testing;
pub use client::{Fetcher, HttpFetcher};
pub use types::{Request, Response};
