// # Core Backend Trait
//
// Defines the command boundary between the sync layer and whatever exposes
// the proxy core: a REST external controller, a native host process, or a
// test double.
//
// ## Implementations
//
// - mihomo external controller: `proxysync-mihomo` crate
// - Test doubles: `tests/common/mod.rs`
//
// ## Usage
//
// ```rust,ignore
// use proxysync_core::CoreBackend;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let backend = /* CoreBackend implementation */;
//
//     let snapshot = backend.get_proxies().await?;
//     println!("{} nodes", snapshot.proxies.len());
//
//     let delay = backend.probe_delay("hk-1", 5000).await?;
//     println!("hk-1: {} ms", delay);
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{
    CoreConfig, ProviderSnapshot, ProxySnapshot, RuleProviderSnapshot, RulesSnapshot,
    SystemProxyState,
};

/// Trait for backend implementations
///
/// One method per command the sync layer issues. Every method is a single
/// request: the caller owns retries, fallbacks, deduplication and
/// scheduling.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Responsibilities
///
/// ## Allowed
/// - Perform requests against the core or the host
/// - Decode responses into the model types
/// - Map failures onto [`Error::Transport`], [`Error::Timeout`] and
///   [`Error::MalformedResponse`]
///
/// ## Forbidden
/// - Retrying or backing off (owned by `DataSyncHub`)
/// - Caching responses (owned by `DataSyncHub`)
/// - Substituting default values on failure (fallback chains are owned by
///   `DataSyncHub`; returning a default would hide the failure)
/// - Spawning background tasks
#[async_trait]
pub trait CoreBackend: Send + Sync {
    /// Fetch every proxy node, in the order the core reports them
    async fn get_proxies(&self) -> Result<ProxySnapshot>;

    /// Fetch every proxy provider, unfiltered
    async fn get_proxy_providers(&self) -> Result<ProviderSnapshot>;

    /// Fetch every rule provider
    async fn get_rule_providers(&self) -> Result<RuleProviderSnapshot>;

    /// Fetch the active rule list
    async fn get_rules(&self) -> Result<RulesSnapshot>;

    /// Fetch the configuration from the core itself
    async fn get_core_config(&self) -> Result<CoreConfig>;

    /// Fetch the configuration the host generated for the core
    ///
    /// Secondary path used when [`get_core_config`](Self::get_core_config)
    /// fails. Backends without a host-side copy keep the default, which
    /// reports [`Error::Unsupported`].
    async fn get_runtime_config(&self) -> Result<CoreConfig> {
        Err(Error::unsupported(format!(
            "{} has no runtime configuration",
            self.backend_name()
        )))
    }

    /// Fetch the operating-system proxy settings
    async fn get_system_proxy(&self) -> Result<SystemProxyState>;

    /// Fetch how the core is being run (e.g. "Sidecar", "Service")
    async fn get_running_mode(&self) -> Result<String>;

    /// Fetch the host process uptime in milliseconds
    async fn get_uptime_ms(&self) -> Result<u64>;

    /// Run one latency test through a node
    ///
    /// # Parameters
    ///
    /// - `proxy_name`: The node to test
    /// - `timeout_ms`: Budget for the test
    ///
    /// # Returns
    ///
    /// - `Ok(ms)`: Raw delay as reported, including sentinel values
    ///   (`0`, values above the timeout)
    /// - `Err(Error::Timeout)`: The budget was exceeded
    /// - `Err(Error)`: Any other failure
    async fn probe_delay(&self, proxy_name: &str, timeout_ms: u64) -> Result<u64>;

    /// Get the backend name (for logging/debugging)
    fn backend_name(&self) -> &'static str;
}
