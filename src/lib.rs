//! Offline-first HTTP cache and sync queue.
//!
//! Sits between an application and the network: classifies every outgoing
//! request, serves cacheable reads through cache-aware strategies, durably
//! queues mutating requests that fail offline, and replays them with
//! at-least-once semantics once connectivity returns.
//!
//! Entry point is [`OfflineAgent`], constructed with injected cache, queue,
//! and network backends (SQLite + reqwest in production, in-memory + mock in
//! tests).

pub mod agent;
pub mod cache;
pub mod config;
pub mod intercept;
pub mod net;
pub mod queue;
pub mod status;
pub mod sync;

pub use agent::{ControlMessage, OfflineAgent};
pub use cache::{CacheBucket, CacheEntry, CacheStore, MemoryCacheStore, SqliteCacheStore};
pub use config::Config;
pub use intercept::{Classifier, Interceptor, RequestClass};
pub use net::{HttpRequest, HttpResponse, NetworkClient, ReqwestClient};
pub use queue::{MemoryQueueStore, QueueStore, QueuedRequest, SqliteQueueStore};
pub use status::{StatusReporter, SubscriberId, SyncProgress, SyncStatus, SyncStep};
pub use sync::{SyncEngine, SyncOutcome};
