//! Data synchronization
//!
//! - [`DataSyncHub`]: per-source cache with single-flight refresh
//! - [`SyncScheduler`]: poll timers and the invalidation queue
//! - [`SyncEvent`]: what the hub reports while refreshing

pub mod cache;
pub mod events;
pub mod hub;
pub mod scheduler;

pub use cache::{CacheEntryInfo, CacheState, SourceKey};
pub use events::{SkipReason, SyncEvent};
pub use hub::{derive_system_proxy_address, DataSyncHub, ProviderMap, SourceValue, DEFAULT_PROXY_HOST};
pub use scheduler::{Invalidation, Invalidator, SyncScheduler, Trigger};
