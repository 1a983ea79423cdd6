// # proxysync-core
//
// Core library for the proxy topology and data synchronization layer of a
// proxy-core control panel.
//
// ## Architecture Overview
//
// This library turns the raw state of a running proxy core into consistent,
// deduplicated views and keeps them current:
// - **CoreBackend**: Trait for the command endpoints of the core and its host
// - **EventSource**: Trait for push notifications announcing changes
// - **ProxyGraphResolver**: Builds the group hierarchy from a flat node map
// - **ProviderRegistry**: Selects the providers usable for member resolution
// - **DataSyncHub**: Per-source cache with single-flight refresh and fallbacks
// - **SyncScheduler**: Poll timers and the invalidation queue driving the hub
// - **EventBridge**: Turns push notifications into hub invalidations
// - **LatencyProbeManager**: Per-(proxy, group) latency state with listeners
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Sync logic is separate from backends
// 2. **Never Fail Outward**: Failures become fallback values or probe states
// 3. **Single Flight**: At most one fetch per source and one probe per key
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Snapshots**: Consumers read immutable `Arc` snapshots

pub mod bridge;
pub mod config;
pub mod error;
pub mod model;
pub mod probe;
pub mod registry;
pub mod sync;
pub mod topology;
pub mod traits;

// Re-export core types for convenience
pub use bridge::{EventBridge, LocalEventBus};
pub use config::{ProbeConfig, ProxyAddressSettings, SourcePolicies, SourcePolicy, SyncConfig};
pub use error::{Error, Result};
pub use probe::{DelayState, DelayUpdate, LatencyProbeManager, ListenerHandle, ProbeOutcome};
pub use registry::ProviderRegistry;
pub use sync::{DataSyncHub, Invalidator, SourceKey, SourceValue, SyncEvent, SyncScheduler, Trigger};
pub use topology::{ProxyGraphResolver, ProxyGroup, ResolvedTopology};
pub use traits::{CoreBackend, EventChannel, EventSource, Subscription};
