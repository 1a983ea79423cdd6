//! Data model shared by every component
//!
//! - [`proxy`]: proxy nodes, providers and their wire shapes
//! - [`runtime`]: core configuration, rules and host state

pub mod runtime;
pub mod proxy;

pub use runtime::{
    CoreConfig, Rule, RuleProvider, RuleProviderSnapshot, RulesSnapshot, SystemProxyState,
    DEFAULT_MIXED_PORT,
};
pub use proxy::{
    Capabilities, DelayRecord, NodeKind, ProviderEntry, ProviderSnapshot, ProxyNode, ProxySnapshot,
    RawProvider, VehicleType, DIRECT, GLOBAL, REJECT, RESERVED_PROBE_NAMES,
    is_reserved_probe_name,
};
