//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::CacheEntry;
use crate::hooks::{SyncQueue, SyncTask};
use crate::http::{Headers, Request, Response, ResponseKind};

/// Trait for cache storage backends.
///
/// Storage is organised in named generations, each an independent
/// request-key → response map.
pub trait CacheStorage: Send + Sync {
  /// Create a generation if it does not exist yet.
  fn open_generation(&self, generation: &str) -> Result<()>;

  /// Names of every generation currently stored.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete_generation(&self, generation: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, generation: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Store a single entry, replacing any previous one under the same key.
  ///
  /// Only writes into an existing generation. Returns false, writing
  /// nothing, if the generation has been deleted.
  fn put(
    &self,
    generation: &str,
    key: &str,
    response: &Response,
    captured_at: Option<DateTime<Utc>>,
  ) -> Result<bool>;

  /// Store several entries in one transaction: either all are written or none.
  /// Creates the generation if needed.
  fn put_all(
    &self,
    generation: &str,
    entries: &[(String, Response)],
    captured_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Number of entries in a generation.
  fn entry_count(&self, generation: &str) -> Result<usize>;

  /// Read a persisted worker state value.
  fn get_state(&self, name: &str) -> Result<Option<String>>;

  /// Write (or clear, with None) a persisted worker state value.
  fn set_state(&self, name: &str, value: Option<&str>) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory database, used by tests and `--ephemeral` runs.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored response snapshots
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    kind TEXT NOT NULL,
    captured_at TEXT,
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);

-- Lifecycle state that must survive restarts
CREATE TABLE IF NOT EXISTS worker_state (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Requests waiting for a background sync
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    queued_at TEXT NOT NULL
);
"#;

fn write_entry(
  conn: &Connection,
  generation: &str,
  key: &str,
  response: &Response,
  captured_at: Option<DateTime<Utc>>,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (generation, key_hash, request_key, status, status_text, headers, body, kind, captured_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        generation,
        hash_key(key),
        key,
        response.status,
        response.status_text,
        headers,
        &response.body[..],
        response.kind.as_str(),
        captured_at.map(|t| t.to_rfc3339()),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

fn create_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, generation: &str) -> Result<()> {
    create_generation(&*self.conn()?, generation)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, generation: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, status_text, headers, body, kind, captured_at FROM entries
         WHERE generation = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (u16, String, String, Vec<u8>, String, Option<String>);
    let row: Option<Row> = stmt
      .query_row(params![generation, hash_key(key)], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    let Some((status, status_text, headers, body, kind, captured_at)) = row else {
      return Ok(None);
    };

    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
    let kind =
      ResponseKind::parse(&kind).ok_or_else(|| eyre!("Unknown response kind '{}'", kind))?;
    let captured_at = captured_at.as_deref().map(parse_datetime).transpose()?;

    Ok(Some(CacheEntry {
      response: Response {
        status,
        status_text,
        headers,
        body: body.into(),
        kind,
      },
      captured_at,
    }))
  }

  fn put(
    &self,
    generation: &str,
    key: &str,
    response: &Response,
    captured_at: Option<DateTime<Utc>>,
  ) -> Result<bool> {
    let conn = self.conn()?;
    let exists = conn
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![generation],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up generation {}: {}", generation, e))?
      .is_some();
    if !exists {
      return Ok(false);
    }

    write_entry(&conn, generation, key, response, captured_at)?;
    Ok(true)
  }

  fn put_all(
    &self,
    generation: &str,
    entries: &[(String, Response)],
    captured_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    create_generation(&tx, generation)?;
    for (key, response) in entries {
      write_entry(&tx, generation, key, response, Some(captured_at))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", generation, e))?;

    Ok(count as usize)
  }

  fn get_state(&self, name: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM worker_state WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read state {}: {}", name, e))
  }

  fn set_state(&self, name: &str, value: Option<&str>) -> Result<()> {
    let conn = self.conn()?;
    let result = match value {
      Some(value) => conn.execute(
        "INSERT OR REPLACE INTO worker_state (name, value) VALUES (?, ?)",
        params![name, value],
      ),
      None => conn.execute("DELETE FROM worker_state WHERE name = ?", params![name]),
    };
    result.map_err(|e| eyre!("Failed to write state {}: {}", name, e))?;

    Ok(())
  }
}

impl SyncQueue for SqliteStorage {
  fn enqueue(&self, task: &SyncTask) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT INTO sync_queue (method, url, queued_at) VALUES (?, ?, ?)",
        params![
          task.request.method,
          task.request.url.as_str(),
          task.queued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to queue {}: {}", task.request, e))?;

    Ok(())
  }

  fn pending(&self) -> Result<Vec<(i64, SyncTask)>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, method, url, queued_at FROM sync_queue ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<(i64, String, String, String)>>>()
      .map_err(|e| eyre!("Failed to read sync queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, queued_at)| {
        let url = url::Url::parse(&url).map_err(|e| eyre!("Invalid queued URL {}: {}", url, e))?;
        let task = SyncTask {
          request: Request::new(&method, url),
          queued_at: parse_datetime(&queued_at)?,
        };
        Ok((id, task))
      })
      .collect()
  }

  fn ack(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;

    Ok(())
  }
}

/// SHA256 of the request key for stable, fixed-length primary keys.
fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse an RFC 3339 timestamp as stored by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use url::Url;

  fn response(body: &str) -> Response {
    Response::new(200, body.as_bytes().to_vec()).with_header("Content-Type", "text/plain")
  }

  fn storage_with(generations: &[&str]) -> SqliteStorage {
    let storage = SqliteStorage::open_in_memory().unwrap();
    for name in generations {
      storage.open_generation(name).unwrap();
    }
    storage
  }

  fn task(method: &str, url: &str, queued_at: DateTime<Utc>) -> SyncTask {
    SyncTask {
      request: Request::new(method, Url::parse(url).unwrap()),
      queued_at,
    }
  }

  #[test]
  fn test_put_then_get_round_trips_snapshot() {
    let storage = storage_with(&["v1"]);
    let now = Utc::now();
    assert!(storage
      .put("v1", "GET /styles.css", &response("body{}"), Some(now))
      .unwrap());

    let entry = storage.get("v1", "GET /styles.css").unwrap().unwrap();
    assert_eq!(entry.response.text(), "body{}");
    assert_eq!(entry.response.headers.get("content-type"), Some("text/plain"));
    assert_eq!(entry.response.kind, ResponseKind::Basic);
    assert_eq!(entry.captured_at.map(|t| t.timestamp()), Some(now.timestamp()));
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = storage_with(&["v1"]);
    storage.put("v1", "k", &response("old"), None).unwrap();
    storage
      .put("v1", "k", &response("new"), Some(Utc::now()))
      .unwrap();

    assert_eq!(storage.entry_count("v1").unwrap(), 1);
    assert_eq!(storage.get("v1", "k").unwrap().unwrap().response.text(), "new");
  }

  #[test]
  fn test_entry_without_capture_time() {
    let storage = storage_with(&["v1"]);
    storage.put("v1", "k", &response("x"), None).unwrap();
    assert!(storage.get("v1", "k").unwrap().unwrap().captured_at.is_none());
  }

  #[test]
  fn test_generations_are_isolated() {
    let storage = storage_with(&["v1", "v2"]);
    storage.put("v1", "k", &response("one"), None).unwrap();
    storage.put("v2", "k", &response("two"), None).unwrap();

    assert_eq!(storage.get("v1", "k").unwrap().unwrap().response.text(), "one");
    assert_eq!(storage.get("v2", "k").unwrap().unwrap().response.text(), "two");
    assert!(storage.get("v3", "k").unwrap().is_none());
  }

  #[test]
  fn test_delete_generation_removes_entries() {
    let storage = storage_with(&["v1", "v2"]);
    storage.put("v1", "k", &response("one"), None).unwrap();

    assert!(storage.delete_generation("v1").unwrap());
    assert!(!storage.delete_generation("v1").unwrap());
    assert_eq!(storage.generations().unwrap(), vec!["v2".to_string()]);
    assert!(storage.get("v1", "k").unwrap().is_none());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
  }

  #[test]
  fn test_put_into_deleted_generation_is_skipped() {
    let storage = storage_with(&["v1"]);
    storage.delete_generation("v1").unwrap();

    assert!(!storage.put("v1", "k", &response("late"), None).unwrap());
    assert!(storage.generations().unwrap().is_empty());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      ("GET /".to_string(), response("home")),
      ("GET /app.js".to_string(), response("js")),
    ];
    storage.put_all("v1", &entries, Utc::now()).unwrap();
    assert_eq!(storage.entry_count("v1").unwrap(), 2);
    assert_eq!(storage.generations().unwrap(), vec!["v1".to_string()]);
  }

  #[test]
  fn test_state_set_and_clear() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_state("current").unwrap(), None);
    storage.set_state("current", Some("v1")).unwrap();
    storage.set_state("current", Some("v2")).unwrap();
    assert_eq!(storage.get_state("current").unwrap().as_deref(), Some("v2"));
    storage.set_state("current", None).unwrap();
    assert_eq!(storage.get_state("current").unwrap(), None);
  }

  #[test]
  fn test_sync_queue_keeps_tasks_until_acked() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    let first = task("GET", "https://directory.example/a", now);
    let second = task("POST", "https://directory.example/b", now + Duration::seconds(1));
    storage.enqueue(&first).unwrap();
    storage.enqueue(&second).unwrap();

    let pending = storage.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].1.request, first.request);
    assert_eq!(pending[1].1.request, second.request);
    assert_eq!(storage.pending().unwrap().len(), 2);

    storage.ack(pending[0].0).unwrap();
    let rest = storage.pending().unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].1.request, second.request);
  }

  #[test]
  fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.open_generation("v1").unwrap();
      storage.put("v1", "k", &response("kept"), None).unwrap();
      storage.set_state("current", Some("v1")).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.get("v1", "k").unwrap().unwrap().response.text(), "kept");
    assert_eq!(storage.get_state("current").unwrap().as_deref(), Some("v1"));
  }
}
