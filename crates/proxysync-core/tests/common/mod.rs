//! Test doubles and common utilities for contract tests
//!
//! This module provides scriptable doubles for the two system boundaries:
//! a backend whose answers, failures and latency are set per test, and an
//! event source whose subscriptions can be delayed or refused.

#![allow(dead_code)]

use proxysync_core::error::{Error, Result};
use proxysync_core::model::{
    CoreConfig, NodeKind, ProviderSnapshot, ProxyNode, ProxySnapshot, RawProvider,
    RuleProviderSnapshot, RulesSnapshot, SystemProxyState, VehicleType,
};
use proxysync_core::traits::{CoreBackend, EventChannel, EventHandler, EventSource, Subscription};
use proxysync_core::SyncConfig;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backend methods, as counted by [`ScriptedBackend`]
pub const GET_PROXIES: &str = "get_proxies";
pub const GET_PROXY_PROVIDERS: &str = "get_proxy_providers";
pub const GET_RULE_PROVIDERS: &str = "get_rule_providers";
pub const GET_RULES: &str = "get_rules";
pub const GET_CORE_CONFIG: &str = "get_core_config";
pub const GET_RUNTIME_CONFIG: &str = "get_runtime_config";
pub const GET_SYSTEM_PROXY: &str = "get_system_proxy";
pub const GET_RUNNING_MODE: &str = "get_running_mode";
pub const GET_UPTIME_MS: &str = "get_uptime_ms";
pub const PROBE_DELAY: &str = "probe_delay";

/// Scripted answer of one latency probe
#[derive(Debug, Clone, Copy)]
pub enum DelayScript {
    Value(u64),
    Timeout,
    Fail,
    /// The backend call panics
    Panic,
}

/// A backend whose answers are set by the test
///
/// Every method counts its calls, waits for the configured latency, then
/// either fails (when marked failing) or returns the scripted value.
pub struct ScriptedBackend {
    proxies: Mutex<ProxySnapshot>,
    providers: Mutex<ProviderSnapshot>,
    core_config: Mutex<CoreConfig>,
    runtime_config: Mutex<Option<CoreConfig>>,
    rules: Mutex<RulesSnapshot>,
    rule_providers: Mutex<RuleProviderSnapshot>,
    system_proxy: Mutex<SystemProxyState>,
    running_mode: Mutex<String>,
    uptime_ms: Mutex<u64>,
    delays: Mutex<HashMap<String, DelayScript>>,
    failing: Mutex<HashSet<&'static str>>,
    latency: Mutex<Duration>,
    probe_latency: Mutex<Duration>,
    calls: Mutex<HashMap<&'static str, usize>>,
    probes_running: AtomicUsize,
    max_probes_running: AtomicUsize,
}

impl ScriptedBackend {
    /// A healthy backend with empty state
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            proxies: Mutex::new(ProxySnapshot::default()),
            providers: Mutex::new(ProviderSnapshot::default()),
            core_config: Mutex::new(CoreConfig::default()),
            runtime_config: Mutex::new(None),
            rules: Mutex::new(RulesSnapshot::default()),
            rule_providers: Mutex::new(RuleProviderSnapshot::default()),
            system_proxy: Mutex::new(SystemProxyState::default()),
            running_mode: Mutex::new("Sidecar".to_string()),
            uptime_ms: Mutex::new(0),
            delays: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
            probe_latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(HashMap::new()),
            probes_running: AtomicUsize::new(0),
            max_probes_running: AtomicUsize::new(0),
        })
    }

    pub fn set_proxies(&self, nodes: Vec<ProxyNode>) {
        *self.proxies.lock().unwrap() = ProxySnapshot { proxies: nodes };
    }

    pub fn set_providers(&self, providers: Vec<RawProvider>) {
        *self.providers.lock().unwrap() = ProviderSnapshot {
            providers: providers
                .into_iter()
                .map(|provider| (provider.name.clone(), provider))
                .collect::<BTreeMap<_, _>>(),
        };
    }

    pub fn set_core_config(&self, config: CoreConfig) {
        *self.core_config.lock().unwrap() = config;
    }

    /// `None` keeps the trait's default (unsupported)
    pub fn set_runtime_config(&self, config: Option<CoreConfig>) {
        *self.runtime_config.lock().unwrap() = config;
    }

    pub fn set_rules(&self, rules: RulesSnapshot) {
        *self.rules.lock().unwrap() = rules;
    }

    pub fn set_system_proxy(&self, state: SystemProxyState) {
        *self.system_proxy.lock().unwrap() = state;
    }

    pub fn set_uptime_ms(&self, uptime_ms: u64) {
        *self.uptime_ms.lock().unwrap() = uptime_ms;
    }

    pub fn set_delay(&self, proxy: &str, script: DelayScript) {
        self.delays.lock().unwrap().insert(proxy.to_string(), script);
    }

    /// Make `method` fail until [`recover`](Self::recover) is called
    pub fn fail(&self, method: &'static str) {
        self.failing.lock().unwrap().insert(method);
    }

    pub fn recover(&self, method: &'static str) {
        self.failing.lock().unwrap().remove(method);
    }

    /// Latency of every non-probe method
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_probe_latency(&self, latency: Duration) {
        *self.probe_latency.lock().unwrap() = latency;
    }

    /// Get the number of times `method` was called
    pub fn call_count(&self, method: &'static str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Highest number of probes observed running at once
    pub fn max_concurrent_probes(&self) -> usize {
        self.max_probes_running.load(Ordering::SeqCst)
    }

    /// Get the total number of calls across all methods
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    async fn enter(&self, method: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(method).or_insert(0) += 1;

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.failing.lock().unwrap().contains(method) {
            return Err(Error::transport(format!("{} unavailable", method)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CoreBackend for ScriptedBackend {
    async fn get_proxies(&self) -> Result<ProxySnapshot> {
        self.enter(GET_PROXIES).await?;
        Ok(self.proxies.lock().unwrap().clone())
    }

    async fn get_proxy_providers(&self) -> Result<ProviderSnapshot> {
        self.enter(GET_PROXY_PROVIDERS).await?;
        Ok(self.providers.lock().unwrap().clone())
    }

    async fn get_rule_providers(&self) -> Result<RuleProviderSnapshot> {
        self.enter(GET_RULE_PROVIDERS).await?;
        Ok(self.rule_providers.lock().unwrap().clone())
    }

    async fn get_rules(&self) -> Result<RulesSnapshot> {
        self.enter(GET_RULES).await?;
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn get_core_config(&self) -> Result<CoreConfig> {
        self.enter(GET_CORE_CONFIG).await?;
        Ok(self.core_config.lock().unwrap().clone())
    }

    async fn get_runtime_config(&self) -> Result<CoreConfig> {
        self.enter(GET_RUNTIME_CONFIG).await?;
        self.runtime_config
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unsupported("no runtime config"))
    }

    async fn get_system_proxy(&self) -> Result<SystemProxyState> {
        self.enter(GET_SYSTEM_PROXY).await?;
        Ok(self.system_proxy.lock().unwrap().clone())
    }

    async fn get_running_mode(&self) -> Result<String> {
        self.enter(GET_RUNNING_MODE).await?;
        Ok(self.running_mode.lock().unwrap().clone())
    }

    async fn get_uptime_ms(&self) -> Result<u64> {
        self.enter(GET_UPTIME_MS).await?;
        Ok(*self.uptime_ms.lock().unwrap())
    }

    async fn probe_delay(&self, proxy_name: &str, timeout_ms: u64) -> Result<u64> {
        *self.calls.lock().unwrap().entry(PROBE_DELAY).or_insert(0) += 1;
        let running = self.probes_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_probes_running.fetch_max(running, Ordering::SeqCst);

        let latency = *self.probe_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.probes_running.fetch_sub(1, Ordering::SeqCst);

        let script = self.delays.lock().unwrap().get(proxy_name).copied();
        match script.unwrap_or(DelayScript::Value(100)) {
            DelayScript::Value(ms) => Ok(ms),
            DelayScript::Timeout => Err(Error::timeout(format!(
                "{} exceeded {}ms",
                proxy_name, timeout_ms
            ))),
            DelayScript::Fail => Err(Error::transport(format!("{} unreachable", proxy_name))),
            DelayScript::Panic => panic!("scripted panic while testing {}", proxy_name),
        }
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }
}

/// An event source whose subscriptions can be delayed or refused
pub struct ControlledEventSource {
    /// How long subscribe() takes
    subscribe_delay: Duration,
    /// Channels whose subscribe() fails
    failing: HashSet<EventChannel>,
    /// Bound handlers
    handlers: Arc<Mutex<HashMap<EventChannel, EventHandler>>>,
    /// Call counter for subscribe()
    subscribe_call_count: Arc<AtomicUsize>,
    /// Number of subscriptions released
    release_count: Arc<AtomicUsize>,
}

impl ControlledEventSource {
    pub fn new() -> Self {
        Self {
            subscribe_delay: Duration::ZERO,
            failing: HashSet::new(),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            subscribe_call_count: Arc::new(AtomicUsize::new(0)),
            release_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    pub fn failing_on(mut self, channel: EventChannel) -> Self {
        self.failing.insert(channel);
        self
    }

    /// Create a source that shares handlers and counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            subscribe_delay: other.subscribe_delay,
            failing: other.failing.clone(),
            handlers: Arc::clone(&other.handlers),
            subscribe_call_count: Arc::clone(&other.subscribe_call_count),
            release_count: Arc::clone(&other.release_count),
        }
    }

    /// Get the number of times subscribe() was called
    pub fn subscribe_call_count(&self) -> usize {
        self.subscribe_call_count.load(Ordering::SeqCst)
    }

    /// Get the number of subscriptions released
    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    /// Number of channels with a bound handler
    pub fn bound_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Deliver a notification; returns false when nothing is bound
    pub fn fire(&self, channel: EventChannel) -> bool {
        let handler = self.handlers.lock().unwrap().get(&channel).cloned();
        match handler {
            Some(handler) => {
                handler(channel);
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl EventSource for ControlledEventSource {
    async fn subscribe(&self, channel: EventChannel, handler: EventHandler) -> Result<Subscription> {
        self.subscribe_call_count.fetch_add(1, Ordering::SeqCst);

        if !self.subscribe_delay.is_zero() {
            tokio::time::sleep(self.subscribe_delay).await;
        }

        if self.failing.contains(&channel) {
            return Err(Error::subscription(channel.name(), "transport not ready"));
        }

        self.handlers.lock().unwrap().insert(channel, handler);

        let handlers = Arc::clone(&self.handlers);
        let release_count = Arc::clone(&self.release_count);
        Ok(Subscription::new(channel, move || {
            release_count.fetch_add(1, Ordering::SeqCst);
            handlers.lock().unwrap().remove(&channel);
        }))
    }
}

/// A plain (non-group) node
pub fn leaf(name: &str, kind: NodeKind) -> ProxyNode {
    ProxyNode::new(name, kind)
}

/// A group node listing `members`
pub fn group(name: &str, kind: NodeKind, members: &[&str]) -> ProxyNode {
    ProxyNode::group(name, kind, members.iter().map(|m| m.to_string()).collect())
}

/// A provider supplying `members`
pub fn provider(name: &str, vehicle: VehicleType, members: Vec<ProxyNode>) -> RawProvider {
    RawProvider {
        name: name.to_string(),
        vehicle_type: vehicle,
        proxies: members,
        updated_at: None,
    }
}

/// A configuration with fast retries and no dedupe window
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::new();
    config.retry_delay_ms = 10;
    config.sources = proxysync_core::SourcePolicies::uniform(proxysync_core::SourcePolicy {
        poll_interval_ms: 0,
        dedupe_window_ms: 0,
        max_retries: 2,
    });
    config
}
