//! Core configuration, rules and host state records

use super::proxy::VehicleType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration record of the running core
///
/// Fields this crate does not interpret are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoreConfig {
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub socks_port: u16,

    #[serde(default)]
    pub mixed_port: u16,

    #[serde(default)]
    pub allow_lan: bool,

    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Mixed port assumed when nothing else is known
pub const DEFAULT_MIXED_PORT: u16 = 7897;

impl Default for CoreConfig {
    /// Configuration assumed when neither the core nor the host can supply one
    fn default() -> Self {
        Self {
            port: 7890,
            socks_port: 7891,
            mixed_port: DEFAULT_MIXED_PORT,
            allow_lan: false,
            mode: default_mode(),
            log_level: default_log_level(),
            extra: serde_json::Map::new(),
        }
    }
}

fn default_mode() -> String {
    "rule".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub proxy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// Response of the rules endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesSnapshot {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A rule provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleProvider {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub behavior: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "vehicleType")]
    pub vehicle_type: VehicleType,
    #[serde(rename = "ruleCount", default)]
    pub rule_count: u64,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Response of the rule-providers endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleProviderSnapshot {
    #[serde(default)]
    pub providers: BTreeMap<String, RuleProvider>,
}

/// Operating-system proxy settings as reported by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProxyState {
    pub enable: bool,
    /// `host:port`, empty or `-` when unset
    pub server: String,
    pub bypass: String,
}
