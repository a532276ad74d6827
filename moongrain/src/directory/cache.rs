//! Per-silo directory lookup cache.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::membership::MembershipVersion;
use crate::types::{GrainAddress, GrainId, SiloAddress};

/// A cached record and the membership version it was learned at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAddress {
    /// The record.
    pub address: GrainAddress,
    /// Membership version at the time of the lookup.
    pub version: MembershipVersion,
}

/// Lookup cache in front of the directory.
///
/// Entries are dropped when their silo leaves the view, when a call to the
/// cached activation fails, or when a callee returns an invalidation hint.
/// A stale hit costs one failed hop; it never creates a second activation,
/// because activation always goes through directory registration.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    entries: RefCell<HashMap<GrainId, CachedAddress>>,
}

impl DirectoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached record for `grain`.
    pub fn get(&self, grain: &GrainId) -> Option<CachedAddress> {
        self.entries.borrow().get(grain).cloned()
    }

    /// Cache `address`, learned at `version`.
    pub fn put(&self, address: GrainAddress, version: MembershipVersion) {
        self.entries.borrow_mut().insert(
            address.grain_id.clone(),
            CachedAddress { address, version },
        );
    }

    /// Drop whatever is cached for `grain`.
    pub fn invalidate(&self, grain: &GrainId) {
        self.entries.borrow_mut().remove(grain);
    }

    /// Drop the entry for `address.grain_id` only if it still names that
    /// activation.
    pub fn invalidate_if_matches(&self, address: &GrainAddress) -> bool {
        let mut entries = self.entries.borrow_mut();
        match entries.get(&address.grain_id) {
            Some(cached) if cached.address.matches(address) => {
                entries.remove(&address.grain_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every entry pointing at one of `silos`.
    pub fn remove_silos(&self, silos: &[SiloAddress]) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|_, cached| !silos.contains(&cached.address.silo));
        before - entries.len()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::placement::PlacementStrategy;
    use crate::types::{ActivationId, GrainType};

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1)
    }

    fn address(key: &str, port: u16, activation: u64) -> GrainAddress {
        GrainAddress::new(
            GrainId::new(GrainType(1), key),
            silo(port),
            ActivationId::new(activation),
            PlacementStrategy::default(),
        )
    }

    #[test]
    fn test_put_get_with_version() {
        let cache = DirectoryCache::new();
        cache.put(address("a", 1, 1), MembershipVersion(4));

        let hit = cache.get(&address("a", 0, 0).grain_id).expect("cached");
        assert_eq!(hit.version, MembershipVersion(4));
        assert_eq!(hit.address.silo, silo(1));
    }

    #[test]
    fn test_invalidate_if_matches_ignores_newer_entry() {
        let cache = DirectoryCache::new();
        cache.put(address("a", 2, 2), MembershipVersion(1));

        assert!(!cache.invalidate_if_matches(&address("a", 1, 1)));
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate_if_matches(&address("a", 2, 2)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_silos() {
        let cache = DirectoryCache::new();
        cache.put(address("a", 1, 1), MembershipVersion(1));
        cache.put(address("b", 2, 2), MembershipVersion(1));
        cache.put(address("c", 1, 3), MembershipVersion(1));

        assert_eq!(cache.remove_silos(&[silo(1)]), 2);
        assert!(cache.get(&address("b", 0, 0).grain_id).is_some());
    }
}
