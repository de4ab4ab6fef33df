//! Client-side response cache for a remote booking API.
//!
//! The cache stores responses to read requests in SQLite with a TTL per entry,
//! keeps the store under a fixed entry count, and queues writes that could not
//! reach the network so the transport can replay them later. It never talks to
//! the network itself.
//!
//! ```ignore
//! let cache = ApiCache::open(Config::load(None)?)?;
//! let scheduler = CleanupScheduler::start_configured(cache.clone())?;
//!
//! let request = RequestDescriptor::get("/bookings").with_param("page", 1);
//! let result = cache
//!   .fetch_cached(&request, TtlClass::Short, || async { transport.send(&request).await })
//!   .await?;
//!
//! scheduler.shutdown().await;
//! ```

pub mod cache;
pub mod config;

pub use cache::{
  ApiCache, CacheEntry, CacheStats, CleanupScheduler, InvalidationPattern, QueueEntry,
  RequestDescriptor, RequestIntent, TtlClass,
};
pub use config::Config;
