//! Read-only statistics over the response cache and the offline queue.

use serde::Serialize;

use super::layer::ApiCache;
use super::storage::CacheStorage;
use super::types::CacheEntry;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub total_items: usize,
  /// Sum of each entry's serialized length; an estimate, not memory use
  pub approx_byte_size: usize,
  pub oldest_timestamp: Option<i64>,
  pub newest_timestamp: Option<i64>,
  /// Live entries that expire within the next 24 hours
  pub expiring_within_24h: usize,
  pub pending_writes: usize,
  pub dead_letters: usize,
  /// Writes dropped by the queue soft cap
  pub dropped_writes: u64,
}

/// Aggregate cache-side statistics for the entries at `now`.
pub(crate) fn summarize(entries: &[CacheEntry], now: i64) -> CacheStats {
  let approx_byte_size = entries
    .iter()
    .map(|e| serde_json::to_vec(e).map(|bytes| bytes.len()).unwrap_or(0))
    .sum();

  CacheStats {
    total_items: entries.len(),
    approx_byte_size,
    oldest_timestamp: entries.iter().map(|e| e.stored_at).min(),
    newest_timestamp: entries.iter().map(|e| e.stored_at).max(),
    expiring_within_24h: entries
      .iter()
      .filter(|e| e.expires_at >= now && e.expires_at <= now + DAY_MS)
      .count(),
    ..CacheStats::default()
  }
}

impl<S: CacheStorage> ApiCache<S> {
  /// Current statistics. Never mutates state; an unavailable store reads as empty.
  pub async fn stats(&self) -> CacheStats {
    let now = self.now();
    let entries = self
      .run_or_default("stats", |storage| storage.entries())
      .await;

    let mut stats = summarize(&entries, now);
    stats.pending_writes = self
      .run_or_default("stats", |storage| {
        storage.list_pending().map(|pending| pending.len())
      })
      .await;
    stats.dead_letters = self
      .run_or_default("stats", |storage| {
        storage.dead_letters().map(|dead| dead.len())
      })
      .await;
    stats.dropped_writes = self
      .run_or_default("stats", |storage| storage.dropped_writes())
      .await;

    stats
  }
}
