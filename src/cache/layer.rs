//! Cache service that owns a store and sits between callers and the network.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::invalidation::InvalidationPattern;
use super::storage::{CacheStorage, SqliteStorage};
use super::traits::{CacheResult, Clock, SystemClock};
use super::types::{CacheEntry, RequestDescriptor, RequestIntent, TtlClass};
use crate::config::Config;

/// Response cache with TTL expiry, capacity eviction and an offline write queue.
///
/// Storage faults never reach callers: reads degrade to a miss, writes become
/// no-ops, and both are logged. Clones share the same store.
pub struct ApiCache<S: CacheStorage = SqliteStorage> {
  storage: Arc<S>,
  config: Arc<Config>,
  clock: Arc<dyn Clock>,
}

impl ApiCache<SqliteStorage> {
  /// Open the SQLite store named by `config.db_path`, or the default location.
  ///
  /// The configuration is validated first.
  pub fn open(config: Config) -> Result<Self> {
    config.validate()?;
    let storage = match &config.db_path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    Ok(Self::new(storage, config))
  }
}

impl<S: CacheStorage> ApiCache<S> {
  /// Create a new cache over the given storage backend.
  pub fn new(storage: S, config: Config) -> Self {
    Self {
      storage: Arc::new(storage),
      config: Arc::new(config),
      clock: Arc::new(SystemClock),
    }
  }

  /// Replace the clock used for expiry decisions.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub(crate) fn now(&self) -> i64 {
    self.clock.now_ms()
  }

  /// Run a storage call on the blocking pool.
  pub(crate) async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || f(storage.as_ref()))
      .await
      .map_err(|e| eyre!("Storage task for {} failed: {}", op, e))?
  }

  /// Like [`run`](Self::run), but a fault is logged and replaced by the default value.
  pub(crate) async fn run_or_default<T, F>(&self, op: &'static str, f: F) -> T
  where
    T: Default + Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    match self.run(op, f).await {
      Ok(value) => value,
      Err(e) => {
        warn!(operation = op, error = %e, "Cache storage fault, continuing without cache");
        T::default()
      }
    }
  }

  /// Look up a live entry. Expired entries are deleted and reported as a miss.
  pub async fn get(&self, key: &str) -> Option<CacheEntry> {
    let now = self.now();
    let key = key.to_string();

    self
      .run_or_default("get", move |storage| match storage.get_entry(&key)? {
        Some(entry) if entry.is_expired(now) => {
          storage.delete_if_expired(&key, now)?;
          debug!(key = %key, "Cache entry expired");
          Ok(None)
        }
        Some(entry) => {
          debug!(key = %key, "Cache hit");
          Ok(Some(entry))
        }
        None => {
          debug!(key = %key, "Cache miss");
          Ok(None)
        }
      })
      .await
  }

  /// Look up the cached response for a request. Writes are never cached.
  pub async fn get_request(&self, request: &RequestDescriptor) -> Option<CacheEntry> {
    if request.intent() != RequestIntent::Read {
      return None;
    }
    self.get(&request.cache_key()).await
  }

  /// Store an entry, replacing any entry under the same key.
  ///
  /// Entries built from write requests, or that expire no later than they
  /// were stored, are ignored.
  pub async fn put(&self, entry: CacheEntry) {
    if entry.intent() != RequestIntent::Read {
      debug!(key = %entry.key, "Skipping cache store for write request");
      return;
    }
    if entry.expires_at <= entry.stored_at {
      warn!(
        key = %entry.key,
        stored_at = entry.stored_at,
        expires_at = entry.expires_at,
        "Skipping cache store for entry that is already expired"
      );
      return;
    }

    self
      .run_or_default("put", move |storage| storage.put_entry(&entry))
      .await
  }

  /// Store a response for `request` under the TTL of `ttl`.
  pub async fn store_response(
    &self,
    request: &RequestDescriptor,
    payload: impl Into<Vec<u8>>,
    ttl: TtlClass,
  ) {
    let ttl = self.config.ttl_for(ttl);
    let entry = CacheEntry::for_response(request, payload, self.now(), ttl);
    self.put(entry).await
  }

  pub async fn delete(&self, key: &str) {
    let key = key.to_string();
    self
      .run_or_default("delete", move |storage| storage.delete_entry(&key).map(|_| ()))
      .await
  }

  pub async fn count(&self) -> usize {
    self
      .run_or_default("count", |storage| storage.count_entries())
      .await
  }

  /// `(key, expires_at)` pairs in ascending expiry order.
  pub async fn scan_by_expiry(&self) -> Vec<(String, i64)> {
    self
      .run_or_default("scan_by_expiry", |storage| storage.scan_by_expiry())
      .await
  }

  /// Remove every cached response. The offline queue is left alone.
  pub async fn clear(&self) -> usize {
    self
      .run_or_default("clear", |storage| storage.clear_entries())
      .await
  }

  /// Fetch a read with cache-first strategy.
  ///
  /// 1. Check cache - if a live entry exists, return it
  /// 2. Otherwise call the fetcher
  /// 3. Store a successful response under `ttl`
  ///
  /// Fetcher errors are returned unchanged; nothing is cached for them.
  pub async fn fetch_cached<F, Fut>(
    &self,
    request: &RequestDescriptor,
    ttl: TtlClass,
    fetcher: F,
  ) -> Result<CacheResult<Vec<u8>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
  {
    if let Some(cached) = self.get_request(request).await {
      return Ok(CacheResult::from_cache(cached.payload, cached.stored_at));
    }

    let data = fetcher().await?;
    if request.intent() == RequestIntent::Read {
      self.store_response(request, data.clone(), ttl).await;
    }
    Ok(CacheResult::from_network(data))
  }

  /// Send a write, keeping the cache consistent with the outcome.
  ///
  /// On success, entries matching `invalidate` are dropped. On
  /// [`SendError::Offline`] the request is queued for replay and `Ok(None)` is
  /// returned. Other failures are returned to the caller.
  pub async fn submit_write<F, Fut, T>(
    &self,
    request: RequestDescriptor,
    invalidate: Option<InvalidationPattern>,
    sender: F,
  ) -> Result<Option<T>>
  where
    F: FnOnce(RequestDescriptor) -> Fut,
    Fut: Future<Output = std::result::Result<T, SendError>>,
  {
    match sender(request.clone()).await {
      Ok(response) => {
        if let Some(pattern) = invalidate {
          self.invalidate(pattern).await?;
        }
        Ok(Some(response))
      }
      Err(SendError::Offline(reason)) => {
        debug!(url = request.url(), reason = %reason, "Network unavailable, queueing write");
        self.enqueue(&request).await;
        Ok(None)
      }
      Err(SendError::Failed(e)) => Err(e),
    }
  }
}

/// Failure reported by a transport when sending a write.
#[derive(Debug)]
pub enum SendError {
  /// The network could not be reached; the write should be retried later
  Offline(String),
  /// The server was reached and rejected the request
  Failed(color_eyre::Report),
}

impl<S: CacheStorage> Clone for ApiCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      config: Arc::clone(&self.config),
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::storage::NoopStorage;
  use crate::cache::traits::{CacheSource, ManualClock};
  use crate::cache::types::{DeadLetter, EnqueueReceipt, FailureOutcome, QueueEntry};
  use std::time::Duration;

  pub(crate) const START: i64 = 1_700_000_000_000;

  pub(crate) fn test_cache(config: Config) -> (ApiCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let cache = ApiCache::new(SqliteStorage::open_in_memory().unwrap(), config)
      .with_clock(clock.clone());
    (cache, clock)
  }

  /// Storage whose every call fails, as if the database were unavailable.
  pub(crate) struct FailingStorage;

  fn unavailable<T>() -> Result<T> {
    Err(eyre!("database is locked"))
  }

  impl CacheStorage for FailingStorage {
    fn put_entry(&self, _entry: &CacheEntry) -> Result<()> {
      unavailable()
    }
    fn get_entry(&self, _key: &str) -> Result<Option<CacheEntry>> {
      unavailable()
    }
    fn delete_entry(&self, _key: &str) -> Result<bool> {
      unavailable()
    }
    fn delete_if_expired(&self, _key: &str, _now: i64) -> Result<bool> {
      unavailable()
    }
    fn scan_by_expiry(&self) -> Result<Vec<(String, i64)>> {
      unavailable()
    }
    fn count_entries(&self) -> Result<usize> {
      unavailable()
    }
    fn oldest_keys(&self, _n: usize) -> Result<Vec<String>> {
      unavailable()
    }
    fn keys(&self) -> Result<Vec<String>> {
      unavailable()
    }
    fn entries(&self) -> Result<Vec<CacheEntry>> {
      unavailable()
    }
    fn clear_entries(&self) -> Result<usize> {
      unavailable()
    }
    fn enqueue(
      &self,
      _request: &RequestDescriptor,
      _now: i64,
      _max_items: usize,
    ) -> Result<EnqueueReceipt> {
      unavailable()
    }
    fn list_pending(&self) -> Result<Vec<QueueEntry>> {
      unavailable()
    }
    fn remove_queued(&self, _id: i64) -> Result<bool> {
      unavailable()
    }
    fn record_failure(
      &self,
      _id: i64,
      _max_attempts: u32,
      _now: i64,
    ) -> Result<Option<FailureOutcome>> {
      unavailable()
    }
    fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
      unavailable()
    }
    fn purge_dead_letters(&self) -> Result<usize> {
      unavailable()
    }
    fn dropped_writes(&self) -> Result<u64> {
      unavailable()
    }
  }

  #[tokio::test]
  async fn put_then_get_returns_payload() {
    let (cache, _) = test_cache(Config::default());
    let request = RequestDescriptor::get("/bookings").with_param("status", "open");

    cache.store_response(&request, b"[1,2]".to_vec(), TtlClass::Medium).await;

    let entry = cache.get_request(&request).await.unwrap();
    assert_eq!(entry.payload, b"[1,2]");
    assert_eq!(entry.method, "GET");
    assert_eq!(entry.url, "/bookings");
    assert_eq!(entry.expires_at - entry.stored_at, 30 * 60 * 1000);
  }

  #[tokio::test]
  async fn short_ttl_expires_after_five_minutes() {
    let (cache, clock) = test_cache(Config::default());
    let request = RequestDescriptor::get("/attenders");
    cache.store_response(&request, b"{}".to_vec(), TtlClass::Short).await;

    assert!(cache.get_request(&request).await.is_some());

    clock.advance(Duration::from_secs(300));
    assert!(cache.get_request(&request).await.is_some());

    clock.advance(Duration::from_millis(1));
    assert!(cache.get_request(&request).await.is_none());
    assert_eq!(cache.count().await, 0);
  }

  #[tokio::test]
  async fn restore_replaces_timestamps() {
    let (cache, clock) = test_cache(Config::default());
    let request = RequestDescriptor::get("/reviews");
    cache.store_response(&request, b"old".to_vec(), TtlClass::Short).await;

    clock.advance(Duration::from_secs(240));
    cache.store_response(&request, b"new".to_vec(), TtlClass::Short).await;

    clock.advance(Duration::from_secs(240));
    let entry = cache.get_request(&request).await.unwrap();
    assert_eq!(entry.payload, b"new");
    assert_eq!(entry.stored_at, START + 240_000);
    assert_eq!(cache.count().await, 1);
  }

  #[tokio::test]
  async fn writes_are_not_cached() {
    let (cache, clock) = test_cache(Config::default());
    let request = RequestDescriptor::post("/bookings");
    let entry = CacheEntry::for_response(
      &request,
      b"{}".to_vec(),
      clock.now_ms(),
      Duration::from_secs(60),
    );

    cache.put(entry.clone()).await;
    assert_eq!(cache.count().await, 0);
    assert!(cache.get(&entry.key).await.is_none());
    assert!(cache.get_request(&request).await.is_none());
  }

  #[tokio::test]
  async fn entries_expiring_before_storage_are_not_cached() {
    let (cache, clock) = test_cache(Config::default());
    let request = RequestDescriptor::get("/x");
    let mut entry = CacheEntry::for_response(
      &request,
      b"{}".to_vec(),
      clock.now_ms(),
      Duration::from_secs(60),
    );

    entry.expires_at = entry.stored_at - 10;
    cache.put(entry.clone()).await;
    assert_eq!(cache.count().await, 0);

    entry.expires_at = entry.stored_at;
    cache.put(entry).await;
    assert_eq!(cache.count().await, 0);
    assert!(cache.get_request(&request).await.is_none());
  }

  #[test]
  fn open_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
      db_path: Some(dir.path().join("cache.db")),
      cleanup_interval_ms: 0,
      ..Config::default()
    };
    assert!(ApiCache::open(config).is_err());
  }

  #[tokio::test]
  async fn concurrent_get_and_sweep_both_see_expiry() {
    let (cache, clock) = test_cache(Config::default());
    let request = RequestDescriptor::get("/attenders");

    for _ in 0..50 {
      cache.store_response(&request, b"{}".to_vec(), TtlClass::Short).await;
      clock.advance(Duration::from_secs(301));

      let (hit, _) = tokio::join!(cache.get_request(&request), cache.sweep_expired());
      assert!(hit.is_none());
      assert_eq!(cache.count().await, 0);
    }
  }

  #[tokio::test]
  async fn delete_twice_is_fine() {
    let (cache, _) = test_cache(Config::default());
    let request = RequestDescriptor::get("/a");
    cache.store_response(&request, b"1".to_vec(), TtlClass::Long).await;

    cache.delete(&request.cache_key()).await;
    cache.delete(&request.cache_key()).await;
    assert!(cache.get_request(&request).await.is_none());
  }

  #[tokio::test]
  async fn storage_faults_degrade_to_miss() {
    let cache = ApiCache::new(FailingStorage, Config::default());
    let request = RequestDescriptor::get("/bookings");

    assert!(cache.get_request(&request).await.is_none());
    // Swallowed, not raised
    cache.store_response(&request, b"{}".to_vec(), TtlClass::Short).await;
    cache.delete("GET:/bookings").await;
    assert_eq!(cache.count().await, 0);
    assert!(cache.scan_by_expiry().await.is_empty());
    assert_eq!(cache.clear().await, 0);
  }

  #[tokio::test]
  async fn noop_storage_disables_caching() {
    let cache = ApiCache::new(NoopStorage, Config::default());
    let request = RequestDescriptor::get("/bookings");
    cache.store_response(&request, b"{}".to_vec(), TtlClass::Short).await;
    assert!(cache.get_request(&request).await.is_none());

    // No queue to hold the write, so no id is handed out
    assert_eq!(cache.enqueue(&RequestDescriptor::post("/bookings")).await, None);
  }

  #[tokio::test]
  async fn fetch_cached_hits_network_once() {
    let (cache, _) = test_cache(Config::default());
    let request = RequestDescriptor::get("/attenders").with_param("page", 1);

    let first = cache
      .fetch_cached(&request, TtlClass::Short, || async { Ok(b"fresh".to_vec()) })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = cache
      .fetch_cached(&request, TtlClass::Short, || async {
        Err(eyre!("network should not be called"))
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, b"fresh");
  }

  #[tokio::test]
  async fn fetch_cached_does_not_store_failures() {
    let (cache, _) = test_cache(Config::default());
    let request = RequestDescriptor::get("/attenders");

    let result = cache
      .fetch_cached(&request, TtlClass::Short, || async { Err(eyre!("502")) })
      .await;
    assert!(result.is_err());
    assert_eq!(cache.count().await, 0);
  }

  #[tokio::test]
  async fn submit_write_invalidates_on_success() {
    let (cache, _) = test_cache(Config::default());
    let list = RequestDescriptor::get("/bookings");
    let other = RequestDescriptor::get("/reviews");
    cache.store_response(&list, b"[]".to_vec(), TtlClass::Long).await;
    cache.store_response(&other, b"[]".to_vec(), TtlClass::Long).await;

    let response = cache
      .submit_write(
        RequestDescriptor::post("/bookings"),
        Some(InvalidationPattern::literal("/bookings")),
        |_| async { Ok::<_, SendError>(201) },
      )
      .await
      .unwrap();

    assert_eq!(response, Some(201));
    assert!(cache.get_request(&list).await.is_none());
    assert!(cache.get_request(&other).await.is_some());
    assert!(cache.list_pending().await.is_empty());
  }

  #[tokio::test]
  async fn submit_write_queues_when_offline() {
    let (cache, _) = test_cache(Config::default());
    let list = RequestDescriptor::get("/bookings");
    cache.store_response(&list, b"[]".to_vec(), TtlClass::Long).await;

    let response = cache
      .submit_write(
        RequestDescriptor::post("/bookings").with_body(b"{}".to_vec()),
        Some(InvalidationPattern::literal("/bookings")),
        |_| async { Err::<(), _>(SendError::Offline("no route to host".to_string())) },
      )
      .await
      .unwrap();

    assert_eq!(response, None);
    let pending = cache.list_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url, "/bookings");
    // Nothing was delivered, so reads stay cached
    assert!(cache.get_request(&list).await.is_some());
  }

  #[tokio::test]
  async fn submit_write_surfaces_server_errors() {
    let (cache, _) = test_cache(Config::default());
    let result = cache
      .submit_write(RequestDescriptor::post("/bookings"), None, |_| async {
        Err::<(), _>(SendError::Failed(eyre!("422 Unprocessable Entity")))
      })
      .await;

    assert!(result.is_err());
    assert!(cache.list_pending().await.is_empty());
  }
}
