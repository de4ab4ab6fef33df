//! Expiry sweeps and capacity eviction.

use color_eyre::Result;
use tracing::{debug, info};

use super::layer::ApiCache;
use super::storage::CacheStorage;

/// Entries removed by one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
  pub expired: usize,
  pub over_capacity: usize,
}

impl EvictionReport {
  pub fn total(&self) -> usize {
    self.expired + self.over_capacity
  }
}

/// Delete every entry that expired before `now`, walking the expiry index.
pub(crate) fn sweep_expired<S: CacheStorage>(storage: &S, now: i64) -> Result<usize> {
  let mut removed = 0;
  for (key, expires_at) in storage.scan_by_expiry()? {
    if expires_at >= now {
      break;
    }
    // Conditional, so an entry re-stored since the scan survives
    if storage.delete_if_expired(&key, now)? {
      removed += 1;
    }
  }
  Ok(removed)
}

/// Delete the oldest-stored entries until at most `max_items` remain.
pub(crate) fn enforce_capacity<S: CacheStorage>(storage: &S, max_items: usize) -> Result<usize> {
  let count = storage.count_entries()?;
  if count <= max_items {
    return Ok(0);
  }

  let mut removed = 0;
  for key in storage.oldest_keys(count - max_items)? {
    if storage.delete_entry(&key)? {
      debug!(key = %key, "Evicted cache entry over capacity");
      removed += 1;
    }
  }
  Ok(removed)
}

pub(crate) fn evict_with<S: CacheStorage>(
  storage: &S,
  now: i64,
  max_items: usize,
) -> Result<EvictionReport> {
  let expired = sweep_expired(storage, now)?;
  let over_capacity = enforce_capacity(storage, max_items)?;
  Ok(EvictionReport {
    expired,
    over_capacity,
  })
}

impl<S: CacheStorage> ApiCache<S> {
  /// Sweep expired entries, then trim to `max_items` oldest-first.
  ///
  /// Returns the number of entries removed. A storage fault ends the pass early
  /// and is logged; the next pass starts over.
  pub async fn evict(&self, max_items: usize) -> usize {
    let now = self.now();
    let report = self
      .run_or_default("evict", move |storage| evict_with(storage, now, max_items))
      .await;

    if report.total() > 0 {
      info!(
        expired = report.expired,
        over_capacity = report.over_capacity,
        "Evicted cache entries"
      );
    }
    report.total()
  }

  /// Eviction pass using the configured `max_items`.
  pub async fn run_cleanup(&self) -> usize {
    self.evict(self.config().max_items).await
  }

  /// Only the expiry sweep, without capacity enforcement.
  pub async fn sweep_expired(&self) -> usize {
    let now = self.now();
    self
      .run_or_default("sweep_expired", move |storage| sweep_expired(storage, now))
      .await
  }
}
