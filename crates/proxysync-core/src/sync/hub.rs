//! Data synchronization hub
//!
//! The DataSyncHub is responsible for:
//! - Keeping one cache entry per data source
//! - Collapsing concurrent refreshes of a source into one backend fetch
//! - Retrying failed fetches and applying per-source fallback chains
//! - Deriving the system proxy address from cached state
//!
//! ## Architecture
//!
//! ```text
//!  SyncScheduler ──┐                      ┌──────────────┐
//!  EventBridge ────┼── invalidate(key) ──►│ DataSyncHub  │── SyncEvent ──► consumer
//!  consumers ──────┘   refresh(key)       └──────────────┘
//!                                                │ one fetch per key at a time
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │ CoreBackend  │
//!                                         └──────────────┘
//! ```
//!
//! ## Fallback Chains
//!
//! | source | on failure |
//! |---|---|
//! | proxies | empty topology with `GLOBAL` and `DIRECT` stubs |
//! | core config | runtime config (per attempt), then built-in defaults |
//! | rules, rule providers, proxy providers | empty |
//! | system proxy, running mode, uptime | last known value |
//!
//! Refreshing never returns an error.

use super::cache::{CacheEntryInfo, FetchOutcome, RefreshMode, SourceCell, SourceKey};
use super::events::SyncEvent;
use crate::config::{ProxyAddressSettings, SourcePolicy, SyncConfig};
use crate::error::{Error, Result};
use crate::model::{
    CoreConfig, ProviderEntry, RuleProviderSnapshot, RulesSnapshot, SystemProxyState,
    DEFAULT_MIXED_PORT,
};
use crate::registry::ProviderRegistry;
use crate::topology::{resolve_topology, ResolvedTopology};
use crate::traits::CoreBackend;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Host used in derived proxy addresses when none is configured
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";

/// Usable proxy providers keyed by provider id
pub type ProviderMap = BTreeMap<String, ProviderEntry>;

/// Value of one source as returned by [`DataSyncHub::refresh`]
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Proxies(Arc<ResolvedTopology>),
    CoreConfig(Arc<CoreConfig>),
    Rules(Arc<RulesSnapshot>),
    RuleProviders(Arc<RuleProviderSnapshot>),
    ProxyProviders(Arc<ProviderMap>),
    SystemProxy(Option<Arc<SystemProxyState>>),
    RunningMode(Option<Arc<String>>),
    /// Host uptime in whole seconds
    UptimeSecs(u64),
}

/// Data synchronization hub
///
/// Owns the cache of every source. All methods take `&self`; share the hub
/// behind an `Arc` between the scheduler, the event bridge and consumers.
///
/// ## Lifecycle
///
/// 1. Create with [`DataSyncHub::new()`]
/// 2. Drive with a [`SyncScheduler`](super::SyncScheduler) and/or direct
///    `refresh` calls
/// 3. Drop to cleanup; fetches still in flight settle into the dropped cells
pub struct DataSyncHub {
    backend: Arc<dyn CoreBackend>,
    registry: ProviderRegistry,
    retry_delay: Duration,
    address: ProxyAddressSettings,

    proxies: Arc<SourceCell<ResolvedTopology>>,
    core_config: Arc<SourceCell<CoreConfig>>,
    rules: Arc<SourceCell<RulesSnapshot>>,
    rule_providers: Arc<SourceCell<RuleProviderSnapshot>>,
    proxy_providers: Arc<SourceCell<ProviderMap>>,
    system_proxy: Arc<SourceCell<SystemProxyState>>,
    running_mode: Arc<SourceCell<String>>,
    uptime: Arc<SourceCell<u64>>,
}

impl DataSyncHub {
    /// Create a new hub
    ///
    /// # Parameters
    ///
    /// - `backend`: Backend implementation
    /// - `config`: Sync configuration
    ///
    /// # Returns
    ///
    /// A tuple of (hub, event_receiver) where event_receiver yields sync events
    pub fn new(
        backend: Arc<dyn CoreBackend>,
        config: &SyncConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let policy = |key: SourceKey| key.policy_in(&config.sources);

        let hub = Self {
            backend,
            registry: ProviderRegistry::default(),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            address: config.address.clone(),
            proxies: SourceCell::new(SourceKey::Proxies, policy(SourceKey::Proxies), tx.clone()),
            core_config: SourceCell::new(SourceKey::CoreConfig, policy(SourceKey::CoreConfig), tx.clone()),
            rules: SourceCell::new(SourceKey::Rules, policy(SourceKey::Rules), tx.clone()),
            rule_providers: SourceCell::new(
                SourceKey::RuleProviders,
                policy(SourceKey::RuleProviders),
                tx.clone(),
            ),
            proxy_providers: SourceCell::new(
                SourceKey::ProxyProviders,
                policy(SourceKey::ProxyProviders),
                tx.clone(),
            ),
            system_proxy: SourceCell::new(SourceKey::SystemProxy, policy(SourceKey::SystemProxy), tx.clone()),
            running_mode: SourceCell::new(SourceKey::RunningMode, policy(SourceKey::RunningMode), tx.clone()),
            uptime: SourceCell::new(SourceKey::Uptime, policy(SourceKey::Uptime), tx),
        };

        info!(
            "Sync hub ready (backend: {}, retry delay: {}ms)",
            hub.backend.backend_name(),
            config.retry_delay_ms
        );

        Ok((hub, rx))
    }

    /// Replace the provider registry used to filter providers
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Refresh one source, honoring its dedupe window
    ///
    /// Concurrent calls for the same source share one fetch. Never fails:
    /// on failure the source's fallback chain decides the returned value.
    pub async fn refresh(&self, key: SourceKey) -> SourceValue {
        self.refresh_source(key, RefreshMode::Deduped).await
    }

    /// Refresh one source, bypassing its dedupe window
    ///
    /// Still joins a fetch already in flight.
    pub async fn invalidate(&self, key: SourceKey) -> SourceValue {
        self.refresh_source(key, RefreshMode::Forced).await
    }

    /// Refresh the user-facing sources concurrently
    ///
    /// Covers proxies, core config, rules, system proxy, proxy providers and
    /// rule providers. Completes once every refresh has settled, successful
    /// or not.
    pub async fn refresh_all(&self) {
        debug!("Refreshing all sources");
        tokio::join!(
            self.refresh_proxies(),
            self.refresh_core_config(),
            self.refresh_rules(),
            self.refresh_system_proxy(),
            self.refresh_proxy_providers(),
            self.refresh_rule_providers(),
        );
    }

    pub async fn refresh_proxies(&self) -> Arc<ResolvedTopology> {
        self.proxies_with(RefreshMode::Deduped).await
    }

    pub async fn refresh_core_config(&self) -> Arc<CoreConfig> {
        self.core_config_with(RefreshMode::Deduped).await
    }

    pub async fn refresh_rules(&self) -> Arc<RulesSnapshot> {
        self.rules_with(RefreshMode::Deduped).await
    }

    pub async fn refresh_rule_providers(&self) -> Arc<RuleProviderSnapshot> {
        self.rule_providers_with(RefreshMode::Deduped).await
    }

    pub async fn refresh_proxy_providers(&self) -> Arc<ProviderMap> {
        self.proxy_providers_with(RefreshMode::Deduped).await
    }

    pub async fn refresh_system_proxy(&self) -> Option<Arc<SystemProxyState>> {
        self.system_proxy_with(RefreshMode::Deduped).await
    }

    pub async fn refresh_running_mode(&self) -> Option<Arc<String>> {
        self.running_mode_with(RefreshMode::Deduped).await
    }

    /// Refresh uptime, in whole seconds (0 while unknown)
    pub async fn refresh_uptime(&self) -> u64 {
        self.uptime_with(RefreshMode::Deduped).await
    }

    /// Cached topology, the fallback topology before the first fetch
    pub fn proxies(&self) -> Arc<ResolvedTopology> {
        self.proxies
            .value()
            .unwrap_or_else(|| Arc::new(ResolvedTopology::fallback()))
    }

    /// Cached core config, built-in defaults before the first fetch
    pub fn core_config(&self) -> Arc<CoreConfig> {
        self.core_config.value().unwrap_or_default()
    }

    pub fn rules(&self) -> Arc<RulesSnapshot> {
        self.rules.value().unwrap_or_default()
    }

    pub fn rule_providers(&self) -> Arc<RuleProviderSnapshot> {
        self.rule_providers.value().unwrap_or_default()
    }

    pub fn proxy_providers(&self) -> Arc<ProviderMap> {
        self.proxy_providers.value().unwrap_or_default()
    }

    pub fn system_proxy(&self) -> Option<Arc<SystemProxyState>> {
        self.system_proxy.value()
    }

    pub fn running_mode(&self) -> Option<Arc<String>> {
        self.running_mode.value()
    }

    /// Cached uptime in whole seconds, 0 while unknown
    pub fn uptime_secs(&self) -> u64 {
        self.uptime.value().map(|secs| *secs).unwrap_or(0)
    }

    /// Address clients should use to reach the proxy
    pub fn system_proxy_address(&self) -> String {
        let core_config = self.core_config.value();
        let system_proxy = self.system_proxy.value();
        derive_system_proxy_address(&self.address, core_config.as_deref(), system_proxy.as_deref())
    }

    /// Bookkeeping of one cache entry
    pub fn entry_snapshot(&self, key: SourceKey) -> CacheEntryInfo {
        match key {
            SourceKey::Proxies => self.proxies.info(),
            SourceKey::CoreConfig => self.core_config.info(),
            SourceKey::Rules => self.rules.info(),
            SourceKey::RuleProviders => self.rule_providers.info(),
            SourceKey::ProxyProviders => self.proxy_providers.info(),
            SourceKey::SystemProxy => self.system_proxy.info(),
            SourceKey::RunningMode => self.running_mode.info(),
            SourceKey::Uptime => self.uptime.info(),
        }
    }

    /// Policy a source was configured with
    pub fn policy(&self, key: SourceKey) -> SourcePolicy {
        match key {
            SourceKey::Proxies => self.proxies.policy(),
            SourceKey::CoreConfig => self.core_config.policy(),
            SourceKey::Rules => self.rules.policy(),
            SourceKey::RuleProviders => self.rule_providers.policy(),
            SourceKey::ProxyProviders => self.proxy_providers.policy(),
            SourceKey::SystemProxy => self.system_proxy.policy(),
            SourceKey::RunningMode => self.running_mode.policy(),
            SourceKey::Uptime => self.uptime.policy(),
        }
    }

    async fn refresh_source(&self, key: SourceKey, mode: RefreshMode) -> SourceValue {
        match key {
            SourceKey::Proxies => SourceValue::Proxies(self.proxies_with(mode).await),
            SourceKey::CoreConfig => SourceValue::CoreConfig(self.core_config_with(mode).await),
            SourceKey::Rules => SourceValue::Rules(self.rules_with(mode).await),
            SourceKey::RuleProviders => {
                SourceValue::RuleProviders(self.rule_providers_with(mode).await)
            }
            SourceKey::ProxyProviders => {
                SourceValue::ProxyProviders(self.proxy_providers_with(mode).await)
            }
            SourceKey::SystemProxy => SourceValue::SystemProxy(self.system_proxy_with(mode).await),
            SourceKey::RunningMode => SourceValue::RunningMode(self.running_mode_with(mode).await),
            SourceKey::Uptime => SourceValue::UptimeSecs(self.uptime_with(mode).await),
        }
    }

    async fn proxies_with(&self, mode: RefreshMode) -> Arc<ResolvedTopology> {
        let backend = Arc::clone(&self.backend);
        let registry = self.registry.clone();
        let retry = self.retry_policy(SourceKey::Proxies);

        self.proxies
            .refresh(mode, move || async move {
                let fetched = retry
                    .run(|| {
                        let backend = Arc::clone(&backend);
                        async move {
                            tokio::try_join!(backend.get_proxies(), backend.get_proxy_providers())
                        }
                    })
                    .await;

                match fetched {
                    Ok((snapshot, providers)) => {
                        let entries = registry.filter(&providers.providers);
                        FetchOutcome::Fresh(resolve_topology(&snapshot.proxies, &entries))
                    }
                    Err(e) => FetchOutcome::fallback(ResolvedTopology::fallback(), e),
                }
            })
            .await
            .unwrap_or_else(|| Arc::new(ResolvedTopology::fallback()))
    }

    async fn core_config_with(&self, mode: RefreshMode) -> Arc<CoreConfig> {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry_policy(SourceKey::CoreConfig);

        self.core_config
            .refresh(mode, move || async move {
                let fetched = retry
                    .run(|| {
                        let backend = Arc::clone(&backend);
                        async move {
                            match backend.get_core_config().await {
                                Ok(config) => Ok(config),
                                Err(primary) => {
                                    debug!("Core config unavailable ({}), trying runtime config", primary);
                                    backend.get_runtime_config().await.map_err(|secondary| {
                                        debug!("Runtime config unavailable: {}", secondary);
                                        primary
                                    })
                                }
                            }
                        }
                    })
                    .await;

                match fetched {
                    Ok(config) => FetchOutcome::Fresh(config),
                    Err(e) => FetchOutcome::fallback(CoreConfig::default(), e),
                }
            })
            .await
            .unwrap_or_default()
    }

    async fn rules_with(&self, mode: RefreshMode) -> Arc<RulesSnapshot> {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry_policy(SourceKey::Rules);

        self.rules
            .refresh(mode, move || async move {
                match retry.run(|| call_backend(&backend, |b| b.get_rules())).await {
                    Ok(rules) => FetchOutcome::Fresh(rules),
                    Err(e) => FetchOutcome::fallback(RulesSnapshot::default(), e),
                }
            })
            .await
            .unwrap_or_default()
    }

    async fn rule_providers_with(&self, mode: RefreshMode) -> Arc<RuleProviderSnapshot> {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry_policy(SourceKey::RuleProviders);

        self.rule_providers
            .refresh(mode, move || async move {
                match retry.run(|| call_backend(&backend, |b| b.get_rule_providers())).await {
                    Ok(providers) => FetchOutcome::Fresh(providers),
                    Err(e) => FetchOutcome::fallback(RuleProviderSnapshot::default(), e),
                }
            })
            .await
            .unwrap_or_default()
    }

    async fn proxy_providers_with(&self, mode: RefreshMode) -> Arc<ProviderMap> {
        let backend = Arc::clone(&self.backend);
        let registry = self.registry.clone();
        let retry = self.retry_policy(SourceKey::ProxyProviders);

        self.proxy_providers
            .refresh(mode, move || async move {
                match retry.run(|| call_backend(&backend, |b| b.get_proxy_providers())).await {
                    Ok(snapshot) => FetchOutcome::Fresh(registry.filter_map(&snapshot.providers)),
                    Err(e) => FetchOutcome::fallback(ProviderMap::new(), e),
                }
            })
            .await
            .unwrap_or_default()
    }

    async fn system_proxy_with(&self, mode: RefreshMode) -> Option<Arc<SystemProxyState>> {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry_policy(SourceKey::SystemProxy);

        self.system_proxy
            .refresh(mode, move || async move {
                match retry.run(|| call_backend(&backend, |b| b.get_system_proxy())).await {
                    Ok(state) => FetchOutcome::Fresh(state),
                    Err(e) => FetchOutcome::keep_last(e),
                }
            })
            .await
    }

    async fn running_mode_with(&self, mode: RefreshMode) -> Option<Arc<String>> {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry_policy(SourceKey::RunningMode);

        self.running_mode
            .refresh(mode, move || async move {
                match retry.run(|| call_backend(&backend, |b| b.get_running_mode())).await {
                    Ok(running_mode) => FetchOutcome::Fresh(running_mode),
                    Err(e) => FetchOutcome::keep_last(e),
                }
            })
            .await
    }

    async fn uptime_with(&self, mode: RefreshMode) -> u64 {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry_policy(SourceKey::Uptime);

        self.uptime
            .refresh(mode, move || async move {
                match retry.run(|| call_backend(&backend, |b| b.get_uptime_ms())).await {
                    Ok(ms) => FetchOutcome::Fresh(ms / 1000),
                    Err(e) => FetchOutcome::keep_last(e),
                }
            })
            .await
            .map(|secs| *secs)
            .unwrap_or(0)
    }

    fn retry_policy(&self, source: SourceKey) -> RetryPolicy {
        RetryPolicy {
            source,
            max_retries: self.policy(source).max_retries,
            delay: self.retry_delay,
        }
    }
}

/// Run one backend command on an owned backend handle
fn call_backend<T: 'static>(
    backend: &Arc<dyn CoreBackend>,
    command: fn(&dyn CoreBackend) -> BoxFuture<'_, Result<T>>,
) -> BoxFuture<'static, Result<T>> {
    let backend = Arc::clone(backend);
    async move { command(backend.as_ref()).await }.boxed()
}

/// Attempts and spacing of one source's fetch
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    source: SourceKey,
    max_retries: usize,
    delay: Duration,
}

impl RetryPolicy {
    async fn run<T, F, Fut>(self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for n in 0..=self.max_retries {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Fetch attempt {} failed for {}: {}", n, self.source, e);
                    last_error = Some(e);

                    // Wait before retry (unless this was the last attempt)
                    if n < self.max_retries {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other("Unknown error".to_string())))
    }
}

/// Derive the address clients should use to reach the proxy
///
/// - With auto-config the address is always `host:port`.
/// - Otherwise the OS-reported server wins when it is set, is not `-` and
///   carries a host (does not start with `:`).
/// - Otherwise `host:port`.
///
/// `port` is the host's mixed port, else the core's, else 7897; a port of
/// 0 counts as unset. `host` defaults to `127.0.0.1`.
pub fn derive_system_proxy_address(
    settings: &ProxyAddressSettings,
    core_config: Option<&CoreConfig>,
    system_proxy: Option<&SystemProxyState>,
) -> String {
    let host = settings
        .proxy_host
        .as_deref()
        .filter(|host| !host.is_empty())
        .unwrap_or(DEFAULT_PROXY_HOST);
    // A port of 0 means unset, both in settings and in the core's report
    let port = settings
        .mixed_port
        .filter(|port| *port != 0)
        .or_else(|| core_config.map(|config| config.mixed_port).filter(|port| *port != 0))
        .unwrap_or(DEFAULT_MIXED_PORT);
    let local = format!("{}:{}", host, port);

    if settings.auto_config {
        return local;
    }

    match system_proxy.map(|state| state.server.as_str()) {
        Some(server) if !server.is_empty() && server != "-" && !server.starts_with(':') => {
            server.to_string()
        }
        _ => local,
    }
}
