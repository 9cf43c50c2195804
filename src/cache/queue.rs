//! Durable persistence for deferred mutation payloads.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, OptionalExtension};
use url::Url;

use crate::net::Request;

use super::storage::{parse_datetime, SqliteStorage};

/// A mutation that failed delivery and awaits replay.
#[derive(Debug, Clone)]
pub struct RetryItem {
  /// Enqueue order
  pub seq: i64,
  pub request: Request,
  pub attempts: u32,
  pub enqueued_at: DateTime<Utc>,
}

/// Trait for retry queue backends. Items come back in enqueue order.
pub trait RetryStore: Send + Sync {
  fn enqueue(&self, request: &Request) -> Result<i64>;

  /// Oldest item still queued.
  fn front(&self) -> Result<Option<RetryItem>>;

  fn remove(&self, seq: i64) -> Result<()>;

  fn record_attempt(&self, seq: i64) -> Result<()>;

  fn len(&self) -> Result<usize>;
}

impl RetryStore for SqliteStorage {
  fn enqueue(&self, request: &Request) -> Result<i64> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO retry_queue (method, url, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![
          request.method.as_str(),
          request.url.as_str(),
          headers,
          request.body
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {}: {}", request.url, e))?;

    Ok(conn.last_insert_rowid())
  }

  fn front(&self) -> Result<Option<RetryItem>> {
    let conn = self.conn()?;
    let row: Option<(i64, String, String, String, Vec<u8>, u32, String)> = conn
      .query_row(
        "SELECT seq, method, url, headers, body, attempts, enqueued_at
         FROM retry_queue ORDER BY seq LIMIT 1",
        [],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read retry queue: {}", e))?;

    let Some((seq, method, url, headers, body, attempts, enqueued_at)) = row else {
      return Ok(None);
    };

    let method = Method::from_bytes(method.as_bytes())
      .map_err(|e| eyre!("Corrupt method in retry item {}: {}", seq, e))?;
    let url = Url::parse(&url).map_err(|e| eyre!("Corrupt url in retry item {}: {}", seq, e))?;
    let headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Corrupt headers in retry item {}: {}", seq, e))?;

    Ok(Some(RetryItem {
      seq,
      request: Request {
        method,
        url,
        headers,
        body,
      },
      attempts,
      enqueued_at: parse_datetime(&enqueued_at)?,
    }))
  }

  fn remove(&self, seq: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM retry_queue WHERE seq = ?", params![seq])
      .map_err(|e| eyre!("Failed to remove retry item {}: {}", seq, e))?;

    Ok(())
  }

  fn record_attempt(&self, seq: i64) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE retry_queue SET attempts = attempts + 1 WHERE seq = ?",
        params![seq],
      )
      .map_err(|e| eyre!("Failed to update retry item {}: {}", seq, e))?;

    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row("SELECT COUNT(*) FROM retry_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count retry queue: {}", e))?;

    Ok(count as usize)
  }
}
