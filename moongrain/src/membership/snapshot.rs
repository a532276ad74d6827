//! Immutable membership view.

use std::collections::BTreeMap;

use super::table::{MembershipEntry, MembershipTableData, MembershipVersion, SiloStatus};
use crate::ring::ConsistentRing;
use crate::types::SiloAddress;

/// Immutable snapshot of the membership table at a specific version.
///
/// Silos never hold live references to each other; everything they know
/// about the cluster is read from the latest snapshot, including the
/// consistent-hash ring of Active silos used for directory partitioning,
/// reminder ownership and probe target selection.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    /// Table version this snapshot was read at.
    pub version: MembershipVersion,
    entries: BTreeMap<SiloAddress, MembershipEntry>,
    ring: ConsistentRing,
}

impl MembershipSnapshot {
    /// Build a snapshot from a table read.
    pub fn from_table(data: MembershipTableData, ring_points: usize) -> Self {
        let entries: BTreeMap<SiloAddress, MembershipEntry> = data
            .entries
            .into_iter()
            .map(|e| (e.silo.clone(), e))
            .collect();
        let ring = ConsistentRing::from_silos(
            entries
                .values()
                .filter(|e| e.status.is_active())
                .map(|e| &e.silo),
            ring_points,
        );
        Self {
            version: data.version,
            entries,
            ring,
        }
    }

    /// Active silos, sorted by address.
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        self.entries
            .values()
            .filter(|e| e.status.is_active())
            .map(|e| e.silo.clone())
            .collect()
    }

    /// Status of `silo`, if it has a row.
    pub fn status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.entries.get(silo).map(|e| e.status)
    }

    /// Whether `silo` is Active in this view.
    pub fn is_active(&self, silo: &SiloAddress) -> bool {
        self.status(silo).is_some_and(SiloStatus::is_active)
    }

    /// Row for `silo`.
    pub fn entry(&self, silo: &SiloAddress) -> Option<&MembershipEntry> {
        self.entries.get(silo)
    }

    /// Every row, including dead ones.
    pub fn entries(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.entries.values()
    }

    /// Ring of Active silos.
    pub fn ring(&self) -> &ConsistentRing {
        &self.ring
    }

    /// Silos Active in `previous` but not in `self`.
    pub fn removed_since(&self, previous: &MembershipSnapshot) -> Vec<SiloAddress> {
        previous
            .active_silos()
            .into_iter()
            .filter(|s| !self.is_active(s))
            .collect()
    }

    /// Silos Active in `self` but not in `previous`.
    pub fn added_since(&self, previous: &MembershipSnapshot) -> Vec<SiloAddress> {
        self.active_silos()
            .into_iter()
            .filter(|s| !previous.is_active(s))
            .collect()
    }
}
