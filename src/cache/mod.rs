//! Persistent API response cache with offline write support.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Keys responses by a canonical (method, URL, params) string
//! - Expires entries lazily on lookup and eagerly from a background sweep
//! - Caps the number of cached entries, evicting the oldest-stored first
//! - Invalidates entries by key pattern after a successful write
//! - Buffers writes made while offline in a durable FIFO queue for replay

mod diagnostics;
mod eviction;
mod invalidation;
mod key;
mod layer;
mod queue;
mod scheduler;
mod storage;
mod traits;
mod types;

pub use diagnostics::CacheStats;
pub use invalidation::InvalidationPattern;
pub use key::generate_key;
pub use layer::{ApiCache, SendError};
pub use queue::ReplaySummary;
pub use scheduler::CleanupScheduler;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{to_datetime, CacheResult, CacheSource, Clock, ManualClock, SystemClock};
pub use types::{
  CacheEntry, DeadLetter, EnqueueReceipt, FailureOutcome, QueueEntry, RequestDescriptor,
  RequestHeaders, RequestIntent, RequestParams, TtlClass,
};
