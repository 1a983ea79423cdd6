// # Proxy Model
//
// Wire-compatible types for proxy nodes and proxy providers as reported by a
// mihomo/clash-family core.
//
// Node and vehicle kinds are open enums: anything the core reports that this
// crate does not know about is carried through as `Other(..)` instead of
// failing the whole snapshot.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved name of the top-level selector
pub const GLOBAL: &str = "GLOBAL";

/// Reserved name of the built-in direct outbound
pub const DIRECT: &str = "DIRECT";

/// Reserved name of the built-in reject outbound
pub const REJECT: &str = "REJECT";

/// Built-in outbounds that are never latency-tested
pub const RESERVED_PROBE_NAMES: [&str; 5] = ["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE"];

/// Whether `name` is a built-in outbound excluded from latency probing
pub fn is_reserved_probe_name(name: &str) -> bool {
    RESERVED_PROBE_NAMES.contains(&name)
}

/// Kind of a proxy node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Selector,
    Direct,
    Reject,
    RejectDrop,
    Pass,
    Compatible,
    UrlTest,
    Fallback,
    LoadBalance,
    Relay,
    /// Synthesized for names with no concrete definition
    Unknown,
    /// Any protocol outbound (Shadowsocks, Vmess, ...)
    Other(String),
}

impl NodeKind {
    /// Get string representation as reported by the core
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Selector => "Selector",
            NodeKind::Direct => "Direct",
            NodeKind::Reject => "Reject",
            NodeKind::RejectDrop => "RejectDrop",
            NodeKind::Pass => "Pass",
            NodeKind::Compatible => "Compatible",
            NodeKind::UrlTest => "URLTest",
            NodeKind::Fallback => "Fallback",
            NodeKind::LoadBalance => "LoadBalance",
            NodeKind::Relay => "Relay",
            NodeKind::Unknown => "unknown",
            NodeKind::Other(kind) => kind,
        }
    }

    /// Whether nodes of this kind select among members
    pub fn is_group_kind(&self) -> bool {
        matches!(
            self,
            NodeKind::Selector
                | NodeKind::UrlTest
                | NodeKind::Fallback
                | NodeKind::LoadBalance
                | NodeKind::Relay
        )
    }
}

impl From<String> for NodeKind {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "selector" | "select" => NodeKind::Selector,
            "direct" => NodeKind::Direct,
            "reject" => NodeKind::Reject,
            "rejectdrop" | "reject-drop" => NodeKind::RejectDrop,
            "pass" => NodeKind::Pass,
            "compatible" => NodeKind::Compatible,
            "urltest" | "url-test" => NodeKind::UrlTest,
            "fallback" => NodeKind::Fallback,
            "loadbalance" | "load-balance" => NodeKind::LoadBalance,
            "relay" => NodeKind::Relay,
            "unknown" | "" => NodeKind::Unknown,
            _ => NodeKind::Other(value),
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unknown_kind() -> NodeKind {
    NodeKind::Unknown
}

/// Transport capability flags of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub xudp: bool,
    /// TCP fast open
    #[serde(default)]
    pub tfo: bool,
    /// Multipath TCP
    #[serde(default)]
    pub mptcp: bool,
    /// Stream multiplexing
    #[serde(default)]
    pub smux: bool,
}

/// One entry of a node's delay history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRecord {
    pub time: DateTime<Utc>,
    pub delay: u64,
}

/// A proxy node: either a protocol outbound or a group selecting among members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNode {
    /// Unique key within one snapshot
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default = "unknown_kind")]
    pub kind: NodeKind,

    #[serde(flatten)]
    pub capabilities: Capabilities,

    /// Member names, present only for groups
    #[serde(rename = "all", default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,

    /// Currently selected member
    #[serde(rename = "now", default, skip_serializing_if = "Option::is_none")]
    pub current_selection: Option<String>,

    #[serde(default)]
    pub history: Vec<DelayRecord>,

    /// Owning provider, set when the node was resolved through a provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ProxyNode {
    /// Create a node of the given kind with no members and no history
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities: Capabilities::default(),
            members: None,
            current_selection: None,
            history: Vec::new(),
            provider: None,
        }
    }

    /// Create a group node with the given member names
    pub fn group(name: impl Into<String>, kind: NodeKind, members: Vec<String>) -> Self {
        Self {
            members: Some(members),
            ..Self::new(name, kind)
        }
    }

    /// Synthesize a stand-in for a referenced name with no concrete definition
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Unknown)
    }

    /// Tag this node with its owning provider
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// A node is a group when it declares a non-empty member list
    pub fn is_group(&self) -> bool {
        self.members.as_ref().is_some_and(|m| !m.is_empty())
    }

    /// Member names, empty for non-groups
    pub fn member_names(&self) -> &[String] {
        self.members.as_deref().unwrap_or(&[])
    }

    /// Most recent delay reported by the core, if any
    pub fn last_delay(&self) -> Option<u64> {
        self.history.last().map(|record| record.delay)
    }
}

/// Response of the proxies endpoint, nodes kept in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySnapshot {
    #[serde(deserialize_with = "deserialize_ordered_nodes", default)]
    pub proxies: Vec<ProxyNode>,
}

/// Deserialize a JSON object of `name -> node` into a vector, keeping the
/// order in which the core emitted the entries
///
/// Entries without a `name` field take their map key as name.
pub fn deserialize_ordered_nodes<'de, D>(deserializer: D) -> Result<Vec<ProxyNode>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedNodes;

    impl<'de> Visitor<'de> for OrderedNodes {
        type Value = Vec<ProxyNode>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of proxy name to proxy node")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut nodes = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, mut node)) = access.next_entry::<String, ProxyNode>()? {
                if node.name.is_empty() {
                    node.name = key;
                }
                nodes.push(node);
            }
            Ok(nodes)
        }
    }

    deserializer.deserialize_map(OrderedNodes)
}

/// How a provider obtains its content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VehicleType {
    Http,
    File,
    Inline,
    /// Compiled into the core
    Compatible,
    Other(String),
}

impl VehicleType {
    pub fn as_str(&self) -> &str {
        match self {
            VehicleType::Http => "HTTP",
            VehicleType::File => "File",
            VehicleType::Inline => "Inline",
            VehicleType::Compatible => "Compatible",
            VehicleType::Other(v) => v,
        }
    }
}

impl From<String> for VehicleType {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("http") {
            VehicleType::Http
        } else if value.eq_ignore_ascii_case("file") {
            VehicleType::File
        } else if value.eq_ignore_ascii_case("inline") {
            VehicleType::Inline
        } else if value.eq_ignore_ascii_case("compatible") {
            VehicleType::Compatible
        } else {
            VehicleType::Other(value)
        }
    }
}

impl From<VehicleType> for String {
    fn from(vehicle: VehicleType) -> Self {
        vehicle.as_str().to_string()
    }
}

fn other_vehicle() -> VehicleType {
    VehicleType::Other(String::new())
}

/// A proxy provider as reported by the core, before filtering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProvider {
    #[serde(default)]
    pub name: String,

    #[serde(rename = "vehicleType", default = "other_vehicle")]
    pub vehicle_type: VehicleType,

    #[serde(default)]
    pub proxies: Vec<ProxyNode>,

    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Response of the proxy-providers endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    #[serde(default)]
    pub providers: BTreeMap<String, RawProvider>,
}

/// A provider usable as a source of group members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub vehicle: VehicleType,
    pub members: Vec<ProxyNode>,
}
