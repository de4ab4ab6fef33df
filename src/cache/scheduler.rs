//! Background task that periodically evicts expired and excess entries.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::layer::ApiCache;
use super::storage::CacheStorage;

/// Handle to a running cleanup task.
///
/// Call [`shutdown`](Self::shutdown) to stop it and wait for the current pass to
/// finish. Dropping the handle aborts the task.
pub struct CleanupScheduler {
  stop: watch::Sender<bool>,
  handle: Option<JoinHandle<()>>,
}

impl CleanupScheduler {
  /// Spawn the cleanup loop. The first pass runs one `interval` after start.
  ///
  /// A zero interval is rejected before anything is spawned.
  pub fn start<S: CacheStorage>(cache: ApiCache<S>, interval: Duration) -> Result<Self> {
    if interval.is_zero() {
      return Err(eyre!("Cleanup interval must be greater than zero"));
    }
    let (stop, mut stopped) = watch::channel(false);

    let handle = tokio::spawn(async move {
      let mut timer = tokio::time::interval(interval);
      timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      timer.tick().await;

      loop {
        tokio::select! {
          _ = timer.tick() => {
            let removed = cache.run_cleanup().await;
            debug!(removed, "Cleanup pass finished");
          }
          changed = stopped.changed() => {
            let stop_requested = changed.is_err() || *stopped.borrow();
            if stop_requested {
              break;
            }
          }
        }
      }
      debug!("Cleanup scheduler stopped");
    });

    info!(interval_ms = interval.as_millis() as u64, "Cleanup scheduler started");
    Ok(Self {
      stop,
      handle: Some(handle),
    })
  }

  /// Start with the interval from the cache's configuration.
  pub fn start_configured<S: CacheStorage>(cache: ApiCache<S>) -> Result<Self> {
    let interval = cache.config().cleanup_interval();
    Self::start(cache, interval)
  }

  pub fn is_running(&self) -> bool {
    self
      .handle
      .as_ref()
      .map(|h| !h.is_finished())
      .unwrap_or(false)
  }

  /// Stop the loop and wait for it to exit.
  pub async fn shutdown(mut self) {
    let _ = self.stop.send(true);
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }
}

impl Drop for CleanupScheduler {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}
