//! Proxy graph resolution
//!
//! Turns the flat `name -> node` map reported by the core, together with the
//! usable provider entries, into the hierarchical view consumed by a UI:
//! the `GLOBAL` selector, the ordered list of groups, and the ungrouped
//! proxies.
//!
//! ## Resolution
//!
//! ```text
//!   member name ──► raw node map ──► provider member index ──► placeholder
//!                   (first hit wins, placeholder never fails)
//! ```
//!
//! ## Group Ordering
//!
//! Groups that are not reachable from `GLOBAL` come first, in raw-map order.
//! Groups reachable from `GLOBAL` come last, in the order `GLOBAL` lists
//! them. A group reachable from `GLOBAL` appears exactly once, in the
//! `GLOBAL` position. Consumers rely on this ordering.
//!
//! Membership may be cyclic (a group listing itself, or groups listing each
//! other). Members are resolved one level only, name to node, so cycles never
//! recurse.

use crate::model::{NodeKind, ProviderEntry, ProxyNode, DIRECT, GLOBAL, REJECT};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Deepest member expansion the resolver performs
///
/// Expansion is one level (group -> member nodes). Anything deeper must go
/// through this guard so cyclic membership can never recurse unbounded.
pub const MAX_EXPANSION_DEPTH: usize = 1;

/// A group node with its members resolved to nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyGroup {
    pub node: ProxyNode,
    pub members: Vec<ProxyNode>,
}

impl ProxyGroup {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }

    /// The member currently selected by the core, if it is a member
    pub fn selected(&self) -> Option<&ProxyNode> {
        let now = self.node.current_selection.as_deref()?;
        self.members.iter().find(|m| m.name == now)
    }
}

/// Hierarchical view of one proxy snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTopology {
    /// The `GLOBAL` selector with resolved members
    pub global: ProxyGroup,

    pub direct: Option<ProxyNode>,

    /// Groups, non-global-reachable first, global-reachable last
    pub groups: Vec<ProxyGroup>,

    /// `DIRECT`, `REJECT`, then every node without members in raw order
    pub ungrouped: Vec<ProxyNode>,

    /// Every raw node plus every node any member list resolved to
    pub by_name: HashMap<String, ProxyNode>,
}

impl ResolvedTopology {
    /// Empty but well-formed topology
    ///
    /// Contains a `GLOBAL` selector stub with no members, a `DIRECT` stub and
    /// no groups.
    pub fn fallback() -> Self {
        let global = ProxyNode::group(GLOBAL, NodeKind::Selector, Vec::new());
        let direct = ProxyNode::new(DIRECT, NodeKind::Direct);

        let mut by_name = HashMap::new();
        by_name.insert(global.name.clone(), global.clone());
        by_name.insert(direct.name.clone(), direct.clone());

        Self {
            global: ProxyGroup {
                node: global,
                members: Vec::new(),
            },
            direct: Some(direct),
            groups: Vec::new(),
            ungrouped: Vec::new(),
            by_name,
        }
    }

    /// Look up a group by name, `GLOBAL` included
    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        if name == GLOBAL {
            return Some(&self.global);
        }
        self.groups.iter().find(|g| g.name() == name)
    }

    /// Look up any node by name
    pub fn get(&self, name: &str) -> Option<&ProxyNode> {
        self.by_name.get(name)
    }

    /// Names in display order of the groups
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name()).collect()
    }
}

/// Resolves member names against raw nodes and provider members
pub struct ProxyGraphResolver<'a> {
    raw: &'a [ProxyNode],

    /// name -> raw node; first occurrence wins
    nodes: HashMap<&'a str, &'a ProxyNode>,

    /// name -> (provider node, provider id); first provider wins
    provider_index: HashMap<&'a str, (&'a ProxyNode, &'a str)>,
}

impl<'a> ProxyGraphResolver<'a> {
    /// Build the lookup indexes
    ///
    /// # Parameters
    ///
    /// - `raw`: nodes in the order the core reported them
    /// - `providers`: usable providers, as returned by
    ///   [`ProviderRegistry::filter`](crate::registry::ProviderRegistry::filter)
    pub fn new(raw: &'a [ProxyNode], providers: &'a [ProviderEntry]) -> Self {
        let mut nodes = HashMap::with_capacity(raw.len());
        for node in raw {
            nodes.entry(node.name.as_str()).or_insert(node);
        }

        // Earlier providers keep their entry when a later one repeats a name
        let mut provider_index = HashMap::new();
        for provider in providers {
            for member in &provider.members {
                provider_index
                    .entry(member.name.as_str())
                    .or_insert((member, provider.provider_id.as_str()));
            }
        }

        Self {
            raw,
            nodes,
            provider_index,
        }
    }

    /// Resolve a member name to a node
    ///
    /// Never fails: unknown names become a placeholder of kind `unknown`
    /// with every capability off and no history.
    pub fn resolve(&self, name: &str) -> ProxyNode {
        if let Some(node) = self.nodes.get(name) {
            return (*node).clone();
        }
        if let Some((node, provider)) = self.provider_index.get(name) {
            return (*node).clone().with_provider(*provider);
        }
        ProxyNode::placeholder(name)
    }

    /// Build the full topology
    pub fn build(&self) -> ResolvedTopology {
        let mut by_name: HashMap<String, ProxyNode> = HashMap::with_capacity(self.raw.len());
        for node in self.raw {
            by_name
                .entry(node.name.clone())
                .or_insert_with(|| node.clone());
        }

        // Groups discoverable by walking GLOBAL
        let global_node = self.nodes.get(GLOBAL).copied();
        let mut global_names = HashSet::new();
        let mut global_groups = Vec::new();
        if let Some(global) = global_node {
            for name in global.member_names() {
                if name == GLOBAL || global_names.contains(name.as_str()) {
                    continue;
                }
                if let Some(node) = self.nodes.get(name.as_str()).filter(|n| n.is_group()) {
                    global_names.insert(name.as_str());
                    global_groups.push(self.expand(node, 1, &mut by_name));
                }
            }
        }

        let mut groups: Vec<ProxyGroup> = self
            .raw
            .iter()
            .filter(|node| node.name != GLOBAL && node.is_group())
            .filter(|node| !global_names.contains(node.name.as_str()))
            .map(|node| self.expand(node, 1, &mut by_name))
            .collect();
        groups.extend(global_groups);

        let direct = self.nodes.get(DIRECT).map(|n| (*n).clone());
        let reject = self.nodes.get(REJECT).map(|n| (*n).clone());

        let mut ungrouped: Vec<ProxyNode> = direct.iter().chain(reject.iter()).cloned().collect();
        ungrouped.extend(
            self.raw
                .iter()
                .filter(|node| !node.is_group())
                .filter(|node| node.name != DIRECT && node.name != REJECT && node.name != GLOBAL)
                .cloned(),
        );

        let global = match global_node {
            Some(node) => self.expand(node, 1, &mut by_name),
            None => ProxyGroup {
                node: ProxyNode::group(GLOBAL, NodeKind::Selector, Vec::new()),
                members: Vec::new(),
            },
        };

        ResolvedTopology {
            global,
            direct,
            groups,
            ungrouped,
            by_name,
        }
    }

    /// Resolve a group's members and record them by name
    fn expand(
        &self,
        node: &ProxyNode,
        depth: usize,
        by_name: &mut HashMap<String, ProxyNode>,
    ) -> ProxyGroup {
        if depth > MAX_EXPANSION_DEPTH {
            warn!("Member expansion of {} exceeds depth {}, truncating", node.name, MAX_EXPANSION_DEPTH);
            return ProxyGroup {
                node: node.clone(),
                members: Vec::new(),
            };
        }

        let members: Vec<ProxyNode> = node
            .member_names()
            .iter()
            .map(|name| self.resolve(name))
            .collect();

        for member in &members {
            by_name
                .entry(member.name.clone())
                .or_insert_with(|| member.clone());
        }

        ProxyGroup {
            node: node.clone(),
            members,
        }
    }
}

/// Resolve a raw snapshot and usable providers into a topology
pub fn resolve_topology(raw: &[ProxyNode], providers: &[ProviderEntry]) -> ResolvedTopology {
    ProxyGraphResolver::new(raw, providers).build()
}
