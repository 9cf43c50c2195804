//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::net::{Request, Response};

use super::traits::{CachedResponse, EntryRef, Generation, GenerationKind};

/// Trait for generation store backends.
///
/// Every method is atomic on its own: a multi-entry write either lands fully
/// or not at all, and deleting a generation removes all of its entries at once.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, generation: &Generation) -> Result<()>;

  /// All generations, oldest first.
  fn generations(&self) -> Result<Vec<Generation>>;

  fn has_generation(&self, name: &str) -> Result<bool>;

  /// Delete a generation together with its entries. Returns false if absent.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Store responses, creating the generation if needed. Re-putting an
  /// existing request replaces it and moves it to the newest position.
  fn put_all(&self, generation: &Generation, entries: &[(Request, Response)]) -> Result<()>;

  fn put(&self, generation: &Generation, request: &Request, response: &Response) -> Result<()> {
    self.put_all(generation, &[(request.clone(), response.clone())])
  }

  /// Look up a request in one generation.
  fn match_in(&self, generation: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across all generations, oldest generation first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Entry index of a generation in insertion order.
  fn entries(&self, generation: &str) -> Result<Vec<EntryRef>>;

  /// Delete specific entries by insertion sequence. Sequences that no longer
  /// exist are skipped. Returns the number removed.
  fn delete_entries(&self, generation: &str, seqs: &[i64]) -> Result<usize>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-based store implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Fresh store that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for store tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }

  pub(super) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for store tables.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq doubles as insertion order for FIFO eviction
CREATE TABLE IF NOT EXISTS entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    generation TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (generation, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(entry_key);

CREATE TABLE IF NOT EXISTS retry_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "e.status, e.status_text, e.headers, e.body, e.generation, e.cached_at";

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, generation: &Generation) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO generations (name, kind) VALUES (?, ?)",
        params![generation.name, generation.kind.as_str()],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation.name, e))?;

    Ok(())
  }

  fn generations(&self) -> Result<Vec<Generation>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name, kind FROM generations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, kind)| {
        let kind = GenerationKind::parse(&kind)
          .ok_or_else(|| eyre!("Unknown kind '{}' for generation {}", kind, name))?;
        Ok(Generation { name, kind })
      })
      .collect()
  }

  fn has_generation(&self, name: &str) -> Result<bool> {
    let found: Option<i64> = self
      .conn()?
      .query_row(
        "SELECT id FROM generations WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put_all(&self, generation: &Generation, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO generations (name, kind) VALUES (?, ?)",
      params![generation.name, generation.kind.as_str()],
    )
    .map_err(|e| eyre!("Failed to open generation {}: {}", generation.name, e))?;

    for (request, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries
           (generation, entry_key, method, url, status, status_text, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation.name,
          request.entry_key(),
          request.method.as_str(),
          request.url.as_str(),
          response.status,
          response.status_text,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", request.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_in(&self, generation: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM entries e WHERE e.generation = ? AND e.entry_key = ?",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![generation, request.entry_key()], read_entry_row)
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", request.url, generation, e))?;

    row.map(decode_entry).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM entries e
       INNER JOIN generations g ON g.name = e.generation
       WHERE e.entry_key = ?
       ORDER BY g.id
       LIMIT 1",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![request.entry_key()], read_entry_row)
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", request.url, e))?;

    row.map(decode_entry).transpose()
  }

  fn entries(&self, generation: &str) -> Result<Vec<EntryRef>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT seq, url FROM entries WHERE generation = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let entries = stmt
      .query_map(params![generation], |row| {
        Ok(EntryRef {
          seq: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", generation, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry row: {}", e))?;

    Ok(entries)
  }

  fn delete_entries(&self, generation: &str, seqs: &[i64]) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut removed = 0;
    {
      let mut stmt = tx
        .prepare("DELETE FROM entries WHERE generation = ? AND seq = ?")
        .map_err(|e| eyre!("Failed to prepare delete: {}", e))?;

      for seq in seqs {
        removed += stmt
          .execute(params![generation, seq])
          .map_err(|e| eyre!("Failed to delete entry {}: {}", seq, e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;

    Ok(())
  }
}

type EntryRow = (u16, String, String, Vec<u8>, String, String);

fn read_entry_row(row: &Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode_entry(
  (status, status_text, headers, body, generation, cached_at): EntryRow,
) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Corrupt headers in {}: {}", generation, e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      status_text,
      headers,
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
    generation,
  })
}

/// Parse a datetime string from SQLite format.
pub(super) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
