//! Offline write queue: durable FIFO of writes that could not reach the network.
//!
//! Each queued write moves `pending -> replaying -> removed` on success, or back
//! to `pending` with a higher retry count on failure. After the configured number
//! of failed replays it is moved to the dead-letter table instead.

use color_eyre::Result;
use std::future::Future;
use tracing::{debug, info, warn};

use super::layer::ApiCache;
use super::storage::CacheStorage;
use super::types::{DeadLetter, FailureOutcome, QueueEntry, RequestDescriptor, RequestIntent};

/// Totals from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
  pub delivered: usize,
  pub failed: usize,
  pub dead_lettered: usize,
  /// Writes still pending after the pass
  pub remaining: usize,
}

impl<S: CacheStorage> ApiCache<S> {
  /// Queue a write for later replay. Returns the assigned id.
  ///
  /// Reads are not queued. Past `max_queue_items` the oldest pending writes are
  /// dropped and counted in diagnostics.
  pub async fn enqueue(&self, request: &RequestDescriptor) -> Option<i64> {
    if request.intent() != RequestIntent::Write {
      debug!(url = request.url(), "Not queueing read request");
      return None;
    }

    let now = self.now();
    let max_items = self.config().max_queue_items;
    let request = request.clone();
    let receipt = self
      .run_or_default("enqueue", move |storage| {
        storage.enqueue(&request, now, max_items).map(Some)
      })
      .await?;

    for id in &receipt.dropped {
      warn!(id, max_items, "Offline queue full, dropped oldest write");
    }
    debug!(id = receipt.id, "Queued offline write");
    Some(receipt.id)
  }

  /// Pending writes, oldest first.
  pub async fn list_pending(&self) -> Vec<QueueEntry> {
    self
      .run_or_default("list_pending", |storage| storage.list_pending())
      .await
  }

  /// Remove a write after it was delivered. Removing an unknown id is a no-op.
  pub async fn remove(&self, id: i64) {
    self
      .run_or_default("remove", move |storage| storage.remove_queued(id).map(|_| ()))
      .await
  }

  /// Record a failed replay of `id`.
  ///
  /// Returns `None` if the id is not pending or the store is unavailable.
  pub async fn record_failure(&self, id: i64) -> Option<FailureOutcome> {
    let now = self.now();
    let max_attempts = self.config().max_replay_attempts;
    let outcome = self
      .run_or_default("record_failure", move |storage| {
        storage.record_failure(id, max_attempts, now)
      })
      .await;

    if let Some(FailureOutcome::DeadLettered { retry_count }) = outcome {
      warn!(id, retry_count, "Queued write exhausted its replay attempts");
    }
    outcome
  }

  /// Replay pending writes in id order through `sender`.
  ///
  /// Delivered writes are removed. The pass stops at the first failure so later
  /// writes are never delivered ahead of an earlier one.
  pub async fn replay_pending<F, Fut>(&self, mut sender: F) -> ReplaySummary
  where
    F: FnMut(QueueEntry) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let mut summary = ReplaySummary::default();
    let pending = self.list_pending().await;

    for entry in pending {
      let id = entry.id;
      match sender(entry).await {
        Ok(()) => {
          self.remove(id).await;
          summary.delivered += 1;
        }
        Err(e) => {
          debug!(id, error = %e, "Replay failed");
          summary.failed += 1;
          if let Some(FailureOutcome::DeadLettered { .. }) = self.record_failure(id).await {
            summary.dead_lettered += 1;
            // The blocking write is out of the way, so the rest may proceed
            continue;
          }
          break;
        }
      }
    }

    summary.remaining = self.list_pending().await.len();
    if summary.delivered > 0 || summary.failed > 0 {
      info!(
        delivered = summary.delivered,
        failed = summary.failed,
        dead_lettered = summary.dead_lettered,
        remaining = summary.remaining,
        "Replayed offline writes"
      );
    }
    summary
  }

  pub async fn dead_letters(&self) -> Vec<DeadLetter> {
    self
      .run_or_default("dead_letters", |storage| storage.dead_letters())
      .await
  }

  pub async fn purge_dead_letters(&self) -> usize {
    self
      .run_or_default("purge_dead_letters", |storage| storage.purge_dead_letters())
      .await
  }
}
