//! Consistent-hash ring over silos.
//!
//! The directory, the reminder service and the failure detector all derive
//! ownership from the same ring: a key belongs to the first silo point at or
//! after it (clockwise, wrapping). A silo owns the arcs `(predecessor, point]`
//! ending at each of its points.
//!
//! The ring is rebuilt from the set of Active silos on every membership view
//! change. Building is deterministic: two silos with the same view compute
//! the same ring, regardless of the order silos were observed in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{GrainId, SiloAddress};

/// Stable 64-bit hash (identical across processes and releases).
pub fn stable_hash(bytes: &[u8]) -> u64 {
    wyhash::wyhash(bytes, 0)
}

/// Ring position of a silo's primary point.
pub fn silo_hash(silo: &SiloAddress) -> u64 {
    stable_hash(&silo.hash_bytes())
}

/// Half-open arc of the ring: `(begin, end]`, wrapping past `u64::MAX`.
///
/// `begin == end` denotes the full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingRange {
    /// Exclusive start.
    pub begin: u64,
    /// Inclusive end.
    pub end: u64,
}

impl RingRange {
    /// The whole ring.
    pub fn full() -> Self {
        Self { begin: 0, end: 0 }
    }

    /// Whether `key` falls in this arc.
    pub fn contains(&self, key: u64) -> bool {
        if self.begin == self.end {
            true
        } else if self.begin < self.end {
            key > self.begin && key <= self.end
        } else {
            key > self.begin || key <= self.end
        }
    }
}

impl fmt::Display for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:016x}, {:016x}]", self.begin, self.end)
    }
}

/// Consistent-hash ring built from a set of silos.
#[derive(Debug, Clone, Default)]
pub struct ConsistentRing {
    points: BTreeMap<u64, SiloAddress>,
}

impl ConsistentRing {
    /// Build a ring with `virtual_nodes` points per silo (at least one).
    pub fn from_silos<'a>(
        silos: impl IntoIterator<Item = &'a SiloAddress>,
        virtual_nodes: usize,
    ) -> Self {
        let mut points: BTreeMap<u64, SiloAddress> = BTreeMap::new();
        let unique: BTreeSet<&SiloAddress> = silos.into_iter().collect();
        for silo in unique {
            let mut key = silo_hash(silo);
            for i in 0..virtual_nodes.max(1) {
                if i > 0 {
                    key = wyhash::wyrng(&mut key);
                }
                // Collisions resolve to the smaller address so the ring does
                // not depend on insertion order.
                match points.get(&key) {
                    Some(existing) if existing <= silo => {}
                    _ => {
                        points.insert(key, silo.clone());
                    }
                }
            }
        }
        Self { points }
    }

    /// Whether the ring has no silos.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Distinct silos on the ring, sorted by address.
    pub fn silos(&self) -> Vec<SiloAddress> {
        let set: BTreeSet<&SiloAddress> = self.points.values().collect();
        set.into_iter().cloned().collect()
    }

    /// Whether `silo` has at least one point on the ring.
    pub fn contains(&self, silo: &SiloAddress) -> bool {
        self.points.values().any(|s| s == silo)
    }

    /// Silo owning the ring position `key`.
    pub fn owner(&self, key: u64) -> Option<&SiloAddress> {
        self.points
            .range(key..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, silo)| silo)
    }

    /// Silo owning the directory partition for `grain`.
    pub fn owner_of(&self, grain: &GrainId) -> Option<&SiloAddress> {
        self.owner(grain.uniform_hash())
    }

    /// Up to `count` distinct silos following `silo` clockwise.
    ///
    /// Starts from `silo`'s primary point; `silo` itself is never returned.
    /// Returns an empty list when `silo` is not on the ring.
    pub fn successors(&self, silo: &SiloAddress, count: usize) -> Vec<SiloAddress> {
        if !self.contains(silo) {
            return Vec::new();
        }
        let start = silo_hash(silo);
        let mut result: Vec<SiloAddress> = Vec::new();
        let walk = self
            .points
            .range(start.saturating_add(1)..)
            .chain(self.points.range(..=start));
        for (_, candidate) in walk {
            if result.len() >= count {
                break;
            }
            if candidate != silo && !result.contains(candidate) {
                result.push(candidate.clone());
            }
        }
        result
    }

    /// Silos owning at least one key of `range`.
    pub fn owners_of_range(&self, range: &RingRange) -> Vec<SiloAddress> {
        let mut owners: BTreeSet<&SiloAddress> = self
            .points
            .iter()
            .filter(|(key, _)| range.contains(**key))
            .map(|(_, silo)| silo)
            .collect();
        if let Some(last) = self.owner(range.end) {
            owners.insert(last);
        }
        owners.into_iter().cloned().collect()
    }

    /// Arcs of the ring owned by `silo`.
    pub fn ranges_of(&self, silo: &SiloAddress) -> Vec<RingRange> {
        if self.points.len() == 1 {
            return if self.contains(silo) {
                vec![RingRange::full()]
            } else {
                Vec::new()
            };
        }
        let keys: Vec<u64> = self.points.keys().copied().collect();
        let mut ranges = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            if self.points.get(key) != Some(silo) {
                continue;
            }
            let previous = if i == 0 { keys[keys.len() - 1] } else { keys[i - 1] };
            ranges.push(RingRange {
                begin: previous,
                end: *key,
            });
        }
        ranges
    }
}
