//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::types::{
  CacheEntry, DeadLetter, EnqueueReceipt, FailureOutcome, QueueEntry, RequestDescriptor,
  RequestIntent,
};

/// Trait for cache storage backends.
///
/// Every call is a short, self-contained operation. Timestamps are passed in by
/// the caller so backends never read the clock themselves.
pub trait CacheStorage: Send + Sync + 'static {
  /// Insert or fully replace the entry under `entry.key`.
  fn put_entry(&self, entry: &CacheEntry) -> Result<()>;

  /// Get an entry by key, expired or not.
  fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Delete an entry. Returns whether a row was removed.
  fn delete_entry(&self, key: &str) -> Result<bool>;

  /// Delete an entry only if it expired before `now`.
  fn delete_if_expired(&self, key: &str, now: i64) -> Result<bool>;

  /// All `(key, expires_at)` pairs in ascending expiry order.
  fn scan_by_expiry(&self) -> Result<Vec<(String, i64)>>;

  fn count_entries(&self) -> Result<usize>;

  /// Keys of the `n` entries stored longest ago.
  fn oldest_keys(&self, n: usize) -> Result<Vec<String>>;

  fn keys(&self) -> Result<Vec<String>>;

  fn entries(&self) -> Result<Vec<CacheEntry>>;

  /// Remove every cached entry.
  fn clear_entries(&self) -> Result<usize>;

  /// Append a write to the offline queue, dropping the oldest writes past `max_items`.
  fn enqueue(&self, request: &RequestDescriptor, now: i64, max_items: usize)
    -> Result<EnqueueReceipt>;

  /// Pending writes in ascending id order.
  fn list_pending(&self) -> Result<Vec<QueueEntry>>;

  /// Remove a queued write. Returns whether a row was removed.
  fn remove_queued(&self, id: i64) -> Result<bool>;

  /// Count a failed replay; past `max_attempts` (if non-zero) the write is dead-lettered.
  fn record_failure(&self, id: i64, max_attempts: u32, now: i64)
    -> Result<Option<FailureOutcome>>;

  fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

  fn purge_dead_letters(&self) -> Result<usize>;

  /// Writes dropped by the queue soft cap since the store was created.
  fn dropped_writes(&self) -> Result<u64>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put_entry(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_entry(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn delete_entry(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_if_expired(&self, _key: &str, _now: i64) -> Result<bool> {
    Ok(false)
  }

  fn scan_by_expiry(&self) -> Result<Vec<(String, i64)>> {
    Ok(Vec::new())
  }

  fn count_entries(&self) -> Result<usize> {
    Ok(0)
  }

  fn oldest_keys(&self, _n: usize) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }

  fn clear_entries(&self) -> Result<usize> {
    Ok(0)
  }

  fn enqueue(
    &self,
    _request: &RequestDescriptor,
    _now: i64,
    _max_items: usize,
  ) -> Result<EnqueueReceipt> {
    // Surfaced so the caller logs the lost write
    Err(eyre!("Offline queue is disabled"))
  }

  fn list_pending(&self) -> Result<Vec<QueueEntry>> {
    Ok(Vec::new())
  }

  fn remove_queued(&self, _id: i64) -> Result<bool> {
    Ok(false)
  }

  fn record_failure(
    &self,
    _id: i64,
    _max_attempts: u32,
    _now: i64,
  ) -> Result<Option<FailureOutcome>> {
    Ok(None)
  }

  fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    Ok(Vec::new())
  }

  fn purge_dead_letters(&self) -> Result<usize> {
    Ok(0)
  }

  fn dropped_writes(&self) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A private database that lives as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("apicache").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cached responses, keyed by canonical request key
CREATE TABLE IF NOT EXISTS response_cache (
    key TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    params TEXT,
    payload BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_expires
    ON response_cache(expires_at);

CREATE INDEX IF NOT EXISTS idx_response_cache_stored
    ON response_cache(stored_at);

-- Writes waiting for connectivity, replayed in id order
CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB,
    headers TEXT,
    enqueued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

-- Writes that ran out of replay attempts
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB,
    headers TEXT,
    enqueued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    failed_at INTEGER NOT NULL
);

-- Counters that must survive restarts
CREATE TABLE IF NOT EXISTS cache_meta (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "key, method, url, params, payload, stored_at, expires_at";
const QUEUE_COLUMNS: &str = "id, method, url, body, headers, enqueued_at, retry_count";

const META_LAST_QUEUE_ID: &str = "last_queue_id";
const META_DROPPED_WRITES: &str = "dropped_writes";

/// A response_cache row before JSON columns are decoded.
struct EntryRow {
  key: String,
  method: String,
  url: String,
  params: Option<String>,
  payload: Vec<u8>,
  stored_at: i64,
  expires_at: i64,
}

impl EntryRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      params: row.get(3)?,
      payload: row.get(4)?,
      stored_at: row.get(5)?,
      expires_at: row.get(6)?,
    })
  }

  fn into_entry(self) -> Result<CacheEntry> {
    let params = self
      .params
      .map(|p| serde_json::from_str(&p))
      .transpose()
      .map_err(|e| eyre!("Failed to decode params for {}: {}", self.key, e))?;

    Ok(CacheEntry {
      key: self.key,
      method: self.method,
      url: self.url,
      params,
      payload: self.payload,
      stored_at: self.stored_at,
      expires_at: self.expires_at,
      // Only reads are ever written to the table
      intent: RequestIntent::Read,
    })
  }
}

/// An offline_queue row before the headers column is decoded.
struct QueueRow {
  id: i64,
  method: String,
  url: String,
  body: Option<Vec<u8>>,
  headers: Option<String>,
  enqueued_at: i64,
  retry_count: u32,
}

impl QueueRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      body: row.get(3)?,
      headers: row.get(4)?,
      enqueued_at: row.get(5)?,
      retry_count: row.get(6)?,
    })
  }

  fn into_entry(self) -> Result<QueueEntry> {
    let headers = self
      .headers
      .map(|h| serde_json::from_str(&h))
      .transpose()
      .map_err(|e| eyre!("Failed to decode headers for queued write {}: {}", self.id, e))?;

    Ok(QueueEntry {
      id: self.id,
      method: self.method,
      url: self.url,
      body: self.body,
      headers,
      enqueued_at: self.enqueued_at,
      retry_count: self.retry_count,
    })
  }
}

fn read_meta(conn: &Connection, name: &str) -> Result<Option<i64>> {
  conn
    .query_row(
      "SELECT value FROM cache_meta WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read {}: {}", name, e))
}

fn write_meta(conn: &Connection, name: &str, value: i64) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO cache_meta (name, value) VALUES (?, ?)",
      params![name, value],
    )
    .map_err(|e| eyre!("Failed to write {}: {}", name, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self.lock()?;
    let params_json = entry
      .params
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize params: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (key, method, url, params, payload, stored_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          entry.key,
          entry.method,
          entry.url,
          params_json,
          entry.payload,
          entry.stored_at,
          entry.expires_at
        ],
      )
      .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    Ok(())
  }

  fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row = conn
      .query_row(
        &format!("SELECT {} FROM response_cache WHERE key = ?", ENTRY_COLUMNS),
        params![key],
        EntryRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry: {}", e))?;

    row.map(EntryRow::into_entry).transpose()
  }

  fn delete_entry(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM response_cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete entry: {}", e))?;
    Ok(removed > 0)
  }

  fn delete_if_expired(&self, key: &str, now: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM response_cache WHERE key = ? AND expires_at < ?",
        params![key, now],
      )
      .map_err(|e| eyre!("Failed to delete expired entry: {}", e))?;
    Ok(removed > 0)
  }

  fn scan_by_expiry(&self) -> Result<Vec<(String, i64)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key, expires_at FROM response_cache ORDER BY expires_at, key")
      .map_err(|e| eyre!("Failed to prepare expiry scan: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to scan expiry index: {}", e))?
      .collect::<rusqlite::Result<Vec<(String, i64)>>>()
      .map_err(|e| eyre!("Failed to read expiry index: {}", e))?;

    Ok(rows)
  }

  fn count_entries(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  fn oldest_keys(&self, n: usize) -> Result<Vec<String>> {
    let conn = self.lock()?;
    // rowid breaks ties between entries stored in the same millisecond
    let mut stmt = conn
      .prepare("SELECT key FROM response_cache ORDER BY stored_at, rowid LIMIT ?")
      .map_err(|e| eyre!("Failed to prepare oldest-entry query: {}", e))?;

    let keys = stmt
      .query_map(params![n as i64], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query oldest entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read oldest entries: {}", e))?;

    Ok(keys)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM response_cache")
      .map_err(|e| eyre!("Failed to prepare key scan: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to scan keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read keys: {}", e))?;

    Ok(keys)
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM response_cache ORDER BY stored_at",
        ENTRY_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare entry scan: {}", e))?;

    let rows = stmt
      .query_map([], EntryRow::from_row)
      .map_err(|e| eyre!("Failed to scan entries: {}", e))?
      .collect::<rusqlite::Result<Vec<EntryRow>>>()
      .map_err(|e| eyre!("Failed to read entries: {}", e))?;

    rows.into_iter().map(EntryRow::into_entry).collect()
  }

  fn clear_entries(&self) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM response_cache", [])
      .map_err(|e| eyre!("Failed to clear entries: {}", e))
  }

  fn enqueue(
    &self,
    request: &RequestDescriptor,
    now: i64,
    max_items: usize,
  ) -> Result<EnqueueReceipt> {
    let mut conn = self.lock()?;
    let headers_json = request
      .headers()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Timestamp ids, bumped past the last issued id so rapid enqueues never collide
    let last_id = read_meta(&tx, META_LAST_QUEUE_ID)?;
    let id = match last_id {
      Some(last) if last >= now => last + 1,
      _ => now,
    };

    tx.execute(
      "INSERT INTO offline_queue (id, method, url, body, headers, enqueued_at, retry_count)
       VALUES (?, ?, ?, ?, ?, ?, 0)",
      params![
        id,
        request.method().to_uppercase(),
        request.url(),
        request.body(),
        headers_json,
        now
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue write: {}", e))?;
    write_meta(&tx, META_LAST_QUEUE_ID, id)?;

    let mut dropped = Vec::new();
    let len: i64 = tx
      .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    let overage = (len as usize).saturating_sub(max_items);

    if max_items > 0 && overage > 0 {
      {
        let mut stmt = tx
          .prepare("SELECT id FROM offline_queue ORDER BY id LIMIT ?")
          .map_err(|e| eyre!("Failed to prepare queue trim: {}", e))?;
        dropped = stmt
          .query_map(params![overage as i64], |row| row.get(0))
          .map_err(|e| eyre!("Failed to select writes to drop: {}", e))?
          .collect::<rusqlite::Result<Vec<i64>>>()
          .map_err(|e| eyre!("Failed to read writes to drop: {}", e))?;
      }

      for dropped_id in &dropped {
        tx.execute("DELETE FROM offline_queue WHERE id = ?", params![dropped_id])
          .map_err(|e| eyre!("Failed to drop queued write: {}", e))?;
      }

      let total = read_meta(&tx, META_DROPPED_WRITES)?.unwrap_or(0);
      write_meta(&tx, META_DROPPED_WRITES, total + dropped.len() as i64)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(EnqueueReceipt { id, dropped })
  }

  fn list_pending(&self) -> Result<Vec<QueueEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM offline_queue ORDER BY id",
        QUEUE_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare queue scan: {}", e))?;

    let rows = stmt
      .query_map([], QueueRow::from_row)
      .map_err(|e| eyre!("Failed to scan queue: {}", e))?
      .collect::<rusqlite::Result<Vec<QueueRow>>>()
      .map_err(|e| eyre!("Failed to read queue: {}", e))?;

    rows.into_iter().map(QueueRow::into_entry).collect()
  }

  fn remove_queued(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM offline_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued write: {}", e))?;
    Ok(removed > 0)
  }

  fn record_failure(
    &self,
    id: i64,
    max_attempts: u32,
    now: i64,
  ) -> Result<Option<FailureOutcome>> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let updated = tx
      .execute(
        "UPDATE offline_queue SET retry_count = retry_count + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to count replay failure: {}", e))?;
    if updated == 0 {
      return Ok(None);
    }

    let retry_count: u32 = tx
      .query_row(
        "SELECT retry_count FROM offline_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read retry count: {}", e))?;

    let outcome = if max_attempts > 0 && retry_count >= max_attempts {
      tx.execute(
        &format!(
          "INSERT OR REPLACE INTO dead_letters ({cols}, failed_at)
           SELECT {cols}, ? FROM offline_queue WHERE id = ?",
          cols = QUEUE_COLUMNS
        ),
        params![now, id],
      )
      .map_err(|e| eyre!("Failed to dead-letter write: {}", e))?;
      tx.execute("DELETE FROM offline_queue WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove dead-lettered write: {}", e))?;
      FailureOutcome::DeadLettered { retry_count }
    } else {
      FailureOutcome::Retrying { retry_count }
    };

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(Some(outcome))
  }

  fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {}, failed_at FROM dead_letters ORDER BY id",
        QUEUE_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare dead-letter scan: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((QueueRow::from_row(row)?, row.get::<_, i64>(7)?)))
      .map_err(|e| eyre!("Failed to scan dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<(QueueRow, i64)>>>()
      .map_err(|e| eyre!("Failed to read dead letters: {}", e))?;

    rows
      .into_iter()
      .map(|(row, failed_at)| {
        Ok(DeadLetter {
          entry: row.into_entry()?,
          failed_at,
        })
      })
      .collect()
  }

  fn purge_dead_letters(&self) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM dead_letters", [])
      .map_err(|e| eyre!("Failed to purge dead letters: {}", e))
  }

  fn dropped_writes(&self) -> Result<u64> {
    let conn = self.lock()?;
    Ok(read_meta(&conn, META_DROPPED_WRITES)?.unwrap_or(0) as u64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn entry(url: &str, stored_at: i64, ttl_secs: u64) -> CacheEntry {
    CacheEntry::for_response(
      &RequestDescriptor::get(url).with_param("page", json!(1)),
      br#"{"ok":true}"#.to_vec(),
      stored_at,
      Duration::from_secs(ttl_secs),
    )
  }

  #[test]
  fn put_get_replace() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let first = entry("/bookings", 1_000, 60);
    storage.put_entry(&first).unwrap();

    let loaded = storage.get_entry(&first.key).unwrap().unwrap();
    assert_eq!(loaded, first);

    let mut second = entry("/bookings", 2_000, 60);
    second.payload = b"[]".to_vec();
    storage.put_entry(&second).unwrap();

    let loaded = storage.get_entry(&first.key).unwrap().unwrap();
    assert_eq!(loaded.stored_at, 2_000);
    assert_eq!(loaded.payload, b"[]");
    assert_eq!(storage.count_entries().unwrap(), 1);
  }

  #[test]
  fn delete_is_idempotent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let e = entry("/a", 0, 60);
    storage.put_entry(&e).unwrap();

    assert!(storage.delete_entry(&e.key).unwrap());
    assert!(!storage.delete_entry(&e.key).unwrap());
    assert!(storage.get_entry(&e.key).unwrap().is_none());
  }

  #[test]
  fn delete_if_expired_keeps_live_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let e = entry("/a", 0, 1);
    storage.put_entry(&e).unwrap();

    assert!(!storage.delete_if_expired(&e.key, 1_000).unwrap());
    assert!(storage.delete_if_expired(&e.key, 1_001).unwrap());
  }

  #[test]
  fn scan_is_ordered_by_expiry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_entry(&entry("/late", 0, 300)).unwrap();
    storage.put_entry(&entry("/early", 0, 10)).unwrap();
    storage.put_entry(&entry("/middle", 0, 60)).unwrap();

    let expiries: Vec<i64> = storage
      .scan_by_expiry()
      .unwrap()
      .into_iter()
      .map(|(_, at)| at)
      .collect();
    assert_eq!(expiries, vec![10_000, 60_000, 300_000]);
  }

  #[test]
  fn oldest_keys_follow_store_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put_entry(&entry("/c", 30, 60)).unwrap();
    storage.put_entry(&entry("/a", 10, 60)).unwrap();
    storage.put_entry(&entry("/b", 20, 60)).unwrap();

    let oldest = storage.oldest_keys(2).unwrap();
    assert_eq!(oldest.len(), 2);
    assert!(oldest[0].starts_with("GET:/a"));
    assert!(oldest[1].starts_with("GET:/b"));
  }

  #[test]
  fn queue_ids_are_unique_for_same_timestamp() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = RequestDescriptor::post("/reviews");

    let a = storage.enqueue(&request, 5_000, 10).unwrap();
    let b = storage.enqueue(&request, 5_000, 10).unwrap();
    let c = storage.enqueue(&request, 4_000, 10).unwrap();

    assert_eq!(a.id, 5_000);
    assert_eq!(b.id, 5_001);
    assert_eq!(c.id, 5_002);

    let ids: Vec<i64> = storage.list_pending().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![5_000, 5_001, 5_002]);
  }

  #[test]
  fn queue_ids_keep_increasing_after_removal() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = RequestDescriptor::post("/reviews");

    let a = storage.enqueue(&request, 100, 10).unwrap();
    storage.remove_queued(a.id).unwrap();
    let b = storage.enqueue(&request, 100, 10).unwrap();
    assert!(b.id > a.id);
  }

  #[test]
  fn queue_soft_cap_drops_oldest() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = RequestDescriptor::post("/uploads");

    for t in 0..3 {
      let receipt = storage.enqueue(&request, t, 3).unwrap();
      assert!(receipt.dropped.is_empty());
    }
    let receipt = storage.enqueue(&request, 3, 3).unwrap();
    assert_eq!(receipt.dropped, vec![0]);

    let ids: Vec<i64> = storage.list_pending().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(storage.dropped_writes().unwrap(), 1);
  }

  #[test]
  fn queue_preserves_request_fields() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let request = RequestDescriptor::new("patch", "/attenders/7")
      .with_body(br#"{"name":"Ana"}"#.to_vec())
      .with_header("content-type", "application/json");

    storage.enqueue(&request, 42, 10).unwrap();
    let pending = storage.list_pending().unwrap();
    assert_eq!(pending.len(), 1);

    let queued = &pending[0];
    assert_eq!(queued.method, "PATCH");
    assert_eq!(queued.url, "/attenders/7");
    assert_eq!(queued.body.as_deref(), Some(&br#"{"name":"Ana"}"#[..]));
    assert_eq!(
      queued.headers.as_ref().unwrap()["content-type"],
      "application/json"
    );
    assert_eq!(queued.enqueued_at, 42);
    assert_eq!(queued.retry_count, 0);
  }

  #[test]
  fn failures_retry_then_dead_letter() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let id = storage
      .enqueue(&RequestDescriptor::post("/bookings"), 1, 10)
      .unwrap()
      .id;

    assert_eq!(
      storage.record_failure(id, 2, 10).unwrap(),
      Some(FailureOutcome::Retrying { retry_count: 1 })
    );
    assert_eq!(storage.list_pending().unwrap()[0].retry_count, 1);

    assert_eq!(
      storage.record_failure(id, 2, 20).unwrap(),
      Some(FailureOutcome::DeadLettered { retry_count: 2 })
    );
    assert!(storage.list_pending().unwrap().is_empty());

    let dead = storage.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entry.id, id);
    assert_eq!(dead[0].failed_at, 20);

    assert_eq!(storage.record_failure(id, 2, 30).unwrap(), None);
    assert_eq!(storage.purge_dead_letters().unwrap(), 1);
    assert!(storage.dead_letters().unwrap().is_empty());
  }

  #[test]
  fn unlimited_attempts_never_dead_letter() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let id = storage
      .enqueue(&RequestDescriptor::post("/bookings"), 1, 10)
      .unwrap()
      .id;

    for attempt in 1..=20 {
      assert_eq!(
        storage.record_failure(id, 0, attempt).unwrap(),
        Some(FailureOutcome::Retrying {
          retry_count: attempt as u32
        })
      );
    }
    assert!(storage.dead_letters().unwrap().is_empty());
  }

  #[test]
  fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let e = entry("/reviews", 1_000, 60);

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put_entry(&e).unwrap();
      storage
        .enqueue(&RequestDescriptor::post("/reviews"), 1_000, 10)
        .unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.get_entry(&e.key).unwrap(), Some(e));
    assert_eq!(storage.list_pending().unwrap().len(), 1);

    let next = storage
      .enqueue(&RequestDescriptor::post("/reviews"), 1_000, 10)
      .unwrap();
    assert_eq!(next.id, 1_001);
  }

  #[test]
  fn noop_storage_always_misses() {
    let storage = NoopStorage;
    let e = entry("/a", 0, 60);
    storage.put_entry(&e).unwrap();
    assert!(storage.get_entry(&e.key).unwrap().is_none());
    assert_eq!(storage.count_entries().unwrap(), 0);
    assert!(storage.list_pending().unwrap().is_empty());
    assert!(storage
      .enqueue(&RequestDescriptor::post("/bookings"), 0, 10)
      .is_err());
  }
}
