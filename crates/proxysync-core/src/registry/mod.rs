//! Provider registry
//!
//! Decides which proxy providers may supply group members and presents them
//! in a deterministic order.
//!
//! Only providers whose vehicle is `HTTP` or `File` participate in member
//! resolution. Providers compiled into the core (`Compatible`) or declared
//! inline are excluded.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use proxysync_core::registry::ProviderRegistry;
//!
//! let registry = ProviderRegistry::new();
//! let usable = registry.filter(&snapshot.providers);
//! for entry in &usable {
//!     println!("{} ({} members)", entry.provider_id, entry.members.len());
//! }
//! ```

use crate::model::{ProviderEntry, RawProvider, VehicleType};
use std::collections::BTreeMap;

/// Filters raw providers down to those usable for member resolution
///
/// The registry is a plain value: it holds only the set of accepted vehicle
/// types and never caches provider data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRegistry {
    /// Vehicle types allowed to supply members
    vehicles: Vec<VehicleType>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self {
            vehicles: vec![VehicleType::Http, VehicleType::File],
        }
    }
}

impl ProviderRegistry {
    /// Create a registry accepting `HTTP` and `File` providers
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a vehicle type may supply members
    pub fn accepts(&self, vehicle: &VehicleType) -> bool {
        self.vehicles.contains(vehicle)
    }

    /// List the accepted vehicle types
    pub fn vehicles(&self) -> &[VehicleType] {
        &self.vehicles
    }

    /// Filter a raw provider map
    ///
    /// # Returns
    ///
    /// Usable providers sorted by provider id
    pub fn filter(&self, raw: &BTreeMap<String, RawProvider>) -> Vec<ProviderEntry> {
        // BTreeMap iteration is already key-sorted
        raw.iter()
            .filter(|(_, provider)| self.accepts(&provider.vehicle_type))
            .map(|(id, provider)| ProviderEntry {
                provider_id: id.clone(),
                vehicle: provider.vehicle_type.clone(),
                members: provider.proxies.clone(),
            })
            .collect()
    }

    /// Filter a raw provider map into an id-keyed map
    pub fn filter_map(&self, raw: &BTreeMap<String, RawProvider>) -> BTreeMap<String, ProviderEntry> {
        self.filter(raw)
            .into_iter()
            .map(|entry| (entry.provider_id.clone(), entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeKind, ProxyNode};

    fn raw(vehicle: VehicleType, members: &[&str]) -> RawProvider {
        RawProvider {
            name: String::new(),
            vehicle_type: vehicle,
            proxies: members
                .iter()
                .map(|m| ProxyNode::new(*m, NodeKind::Other("Vmess".into())))
                .collect(),
            updated_at: None,
        }
    }

    #[test]
    fn test_only_http_and_file_are_usable() {
        let registry = ProviderRegistry::new();

        let mut map = BTreeMap::new();
        map.insert("remote".to_string(), raw(VehicleType::Http, &["a"]));
        map.insert("local".to_string(), raw(VehicleType::File, &["b"]));
        map.insert("default".to_string(), raw(VehicleType::Compatible, &["c"]));
        map.insert("inline".to_string(), raw(VehicleType::Inline, &["d"]));

        let usable = registry.filter(&map);
        let ids: Vec<&str> = usable.iter().map(|e| e.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["local", "remote"]);
    }

    #[test]
    fn test_filter_is_sorted_by_id() {
        let registry = ProviderRegistry::new();

        let mut map = BTreeMap::new();
        for id in ["zz", "aa", "mm"] {
            map.insert(id.to_string(), raw(VehicleType::Http, &[]));
        }

        let ids: Vec<String> = registry.filter(&map).into_iter().map(|e| e.provider_id).collect();
        assert_eq!(ids, vec!["aa", "mm", "zz"]);
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let registry = ProviderRegistry::new();
        assert!(registry.filter(&BTreeMap::new()).is_empty());
        assert!(registry.filter_map(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_accepts() {
        let registry = ProviderRegistry::new();
        assert!(registry.accepts(&VehicleType::Http));
        assert!(registry.accepts(&VehicleType::File));
        assert!(!registry.accepts(&VehicleType::Compatible));
        assert!(!registry.accepts(&VehicleType::Other("Custom".into())));
        assert_eq!(registry.vehicles().len(), 2);
    }
}
