//! Versioned response caches for offline support.
//!
//! Two independently named buckets: one for immutable static assets, one for
//! time-sensitive API responses. Every entry is stamped with its fetch time so
//! the interception layer can flag aged API data as stale.

mod storage;
mod traits;

pub use storage::{MemoryCacheStore, SqliteCacheStore};
pub use traits::{cache_key, CacheBucket, CacheEntry, CacheStore, CACHE_VERSION};
