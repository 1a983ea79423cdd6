//! Configuration types for the proxysync system
//!
//! This module defines all configuration structures used throughout the crate.
//! Every field has a serde default, so an empty document is a valid
//! configuration.

use serde::{Deserialize, Serialize};

/// Main sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Refresh policy of every data source
    #[serde(default)]
    pub sources: SourcePolicies,

    /// Delay between retry attempts of one refresh (in milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Capacity of the sync event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Latency probe settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Settings used to derive the system proxy address
    #[serde(default)]
    pub address: ProxyAddressSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources: SourcePolicies::default(),
            retry_delay_ms: default_retry_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            probe: ProbeConfig::default(),
            address: ProxyAddressSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event_channel_capacity must be > 0"));
        }
        if self.probe.default_timeout_ms == 0 {
            return Err(crate::Error::config("probe.default_timeout_ms must be > 0"));
        }

        self.sources.validate()?;
        Ok(())
    }
}

/// Refresh policy of one data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePolicy {
    /// Polling interval, 0 disables polling
    pub poll_interval_ms: u64,

    /// A fetch started within this window is reused instead of repeated
    pub dedupe_window_ms: u64,

    /// Additional attempts after the first failure
    pub max_retries: usize,
}

impl SourcePolicy {
    /// Near-real-time polling (proxy topology)
    pub const fn realtime() -> Self {
        Self {
            poll_interval_ms: 2_000,
            dedupe_window_ms: 1_000,
            max_retries: 2,
        }
    }

    /// Slow polling (core configuration)
    pub const fn slow_poll() -> Self {
        Self {
            poll_interval_ms: 60_000,
            dedupe_window_ms: 5_000,
            max_retries: 2,
        }
    }

    /// Default polling (providers, rules, host state)
    pub const fn standard() -> Self {
        Self {
            poll_interval_ms: 10_000,
            dedupe_window_ms: 2_000,
            max_retries: 2,
        }
    }

    /// Short fixed interval with a single retry (uptime)
    pub const fn uptime() -> Self {
        Self {
            poll_interval_ms: 3_000,
            dedupe_window_ms: 1_000,
            max_retries: 1,
        }
    }

    /// Whether this source is polled
    pub fn polls(&self) -> bool {
        self.poll_interval_ms > 0
    }

    fn validate(&self, source: &str) -> Result<(), crate::Error> {
        if self.polls() && self.dedupe_window_ms > self.poll_interval_ms {
            return Err(crate::Error::config(format!(
                "{}: dedupe window ({}ms) exceeds poll interval ({}ms)",
                source, self.dedupe_window_ms, self.poll_interval_ms
            )));
        }
        Ok(())
    }
}

/// Policies of every data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePolicies {
    #[serde(default = "SourcePolicy::realtime")]
    pub proxies: SourcePolicy,

    #[serde(default = "SourcePolicy::slow_poll")]
    pub core_config: SourcePolicy,

    #[serde(default = "SourcePolicy::standard")]
    pub rules: SourcePolicy,

    #[serde(default = "SourcePolicy::standard")]
    pub rule_providers: SourcePolicy,

    #[serde(default = "SourcePolicy::standard")]
    pub proxy_providers: SourcePolicy,

    #[serde(default = "SourcePolicy::standard")]
    pub system_proxy: SourcePolicy,

    #[serde(default = "SourcePolicy::standard")]
    pub running_mode: SourcePolicy,

    #[serde(default = "SourcePolicy::uptime")]
    pub uptime: SourcePolicy,
}

impl Default for SourcePolicies {
    fn default() -> Self {
        Self {
            proxies: SourcePolicy::realtime(),
            core_config: SourcePolicy::slow_poll(),
            rules: SourcePolicy::standard(),
            rule_providers: SourcePolicy::standard(),
            proxy_providers: SourcePolicy::standard(),
            system_proxy: SourcePolicy::standard(),
            running_mode: SourcePolicy::standard(),
            uptime: SourcePolicy::uptime(),
        }
    }
}

impl SourcePolicies {
    /// Apply one policy to every source
    pub fn uniform(policy: SourcePolicy) -> Self {
        Self {
            proxies: policy,
            core_config: policy,
            rules: policy,
            rule_providers: policy,
            proxy_providers: policy,
            system_proxy: policy,
            running_mode: policy,
            uptime: policy,
        }
    }

    fn validate(&self) -> Result<(), crate::Error> {
        self.proxies.validate("proxies")?;
        self.core_config.validate("core_config")?;
        self.rules.validate("rules")?;
        self.rule_providers.validate("rule_providers")?;
        self.proxy_providers.validate("proxy_providers")?;
        self.system_proxy.validate("system_proxy")?;
        self.running_mode.validate("running_mode")?;
        self.uptime.validate("uptime")
    }
}

/// Latency probe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Timeout used when the caller supplies none
    #[serde(default = "default_probe_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Upper bound on probes in flight at once, 0 means unbounded
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// URL the core fetches through the node under test
    #[serde(default = "default_test_url")]
    pub test_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_probe_timeout_ms(),
            max_concurrent_probes: default_max_concurrent_probes(),
            test_url: default_test_url(),
        }
    }
}

/// Host-side proxy settings feeding the system proxy address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAddressSettings {
    /// The host serves a proxy auto-config instead of a fixed server
    #[serde(default)]
    pub auto_config: bool,

    /// Host advertised to clients, `127.0.0.1` when unset
    #[serde(default)]
    pub proxy_host: Option<String>,

    /// Mixed port chosen by the host, overrides the core's
    #[serde(default)]
    pub mixed_port: Option<u16>,
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_max_concurrent_probes() -> usize {
    32
}

fn default_test_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sources, SourcePolicies::default());
        assert_eq!(config.retry_delay_ms, 500);
        assert_eq!(config.event_channel_capacity, 1000);
        assert_eq!(config.probe.default_timeout_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_uptime_policy_retries_once() {
        let policies = SourcePolicies::default();
        assert_eq!(policies.uptime.max_retries, 1);
        assert_eq!(policies.uptime.poll_interval_ms, 3_000);
        assert!(policies.proxies.poll_interval_ms < policies.core_config.poll_interval_ms);
    }

    #[test]
    fn test_dedupe_longer_than_poll_is_rejected() {
        let mut config = SyncConfig::new();
        config.sources.rules = SourcePolicy {
            poll_interval_ms: 1_000,
            dedupe_window_ms: 5_000,
            max_retries: 0,
        };
        assert!(config.validate().is_err());

        // Without polling any window is fine
        config.sources.rules.poll_interval_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let config = SyncConfig {
            event_channel_capacity: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
