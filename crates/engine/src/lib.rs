//! Feature cache engine
//!
//! This crate orchestrates the lower layers:
//! - FeatureCache: insert, remove, query, open/close
//! - Backend assistants: disk block files or an external object registry
//! - Query engine: resident hits plus demand retrieval in waves
//! - Eviction: memory-pressure driven LRU reclamation of payloads
//! - Background I/O: priority-ordered spill and fetch pools
//!
//! The engine is the only component that knows about:
//! - Which backend holds a spilled payload
//! - When payloads may leave memory
//! - Listener and load-filter hooks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod background;
pub mod cache;
pub mod config;
pub mod eviction;
pub mod filter;
pub mod listener;
pub mod query;

pub use backend::{
    BackendAssistant, DirectAccessRetriever, DiskAssistant, InMemoryRegistry, ObjectRegistry,
    PropertyAccessor, PropertyMap, PropertyValue, RegistryAssistant, Retrieved, RetrieveRequest,
    RetrieveUpdate,
};
pub use background::{BackgroundScheduler, BackpressureError, CompletionLatch, IoPools, SchedulerStats, TaskPriority};
pub use cache::{CacheBuilder, FeatureCache};
pub use config::{BackendKind, CacheConfig, CONFIG_FILE_NAME};
pub use eviction::{
    evict_to_target, EvictionController, EvictionPolicy, EvictionStats, MemoryMonitor, MemoryPressure,
    PressureWatcher,
};
pub use filter::{LoadFilter, TimeWindowFilter};
pub use listener::CacheListener;
pub use query::{CacheQuery, CachedRecord, CollectingQuery, QueryEngine, QueryScope, QueryStats};
