//! One silo's shard of the directory.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::types::{GrainAddress, GrainId, SiloAddress};

/// In-memory records for the grains whose hash falls in this silo's arcs.
///
/// Every operation is synchronous: the partition owner evaluates requests
/// for the same grain one after another, in arrival order, which is what
/// makes the first accepted registration the winner.
#[derive(Debug, Default)]
pub struct DirectoryPartition {
    records: RefCell<HashMap<GrainId, GrainAddress>>,
}

impl DirectoryPartition {
    /// Create an empty partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` unless a live record already exists.
    ///
    /// A record hosted on a silo for which `is_live` returns false is
    /// replaced. Returns the record now in place.
    pub fn register(
        &self,
        address: GrainAddress,
        is_live: impl Fn(&SiloAddress) -> bool,
    ) -> GrainAddress {
        let mut records = self.records.borrow_mut();
        if let Some(existing) = records.get(&address.grain_id) {
            if existing.matches(&address) || is_live(&existing.silo) {
                return existing.clone();
            }
            tracing::debug!(grain = %address.grain_id, stale = %existing, "replacing record on departed silo");
        }
        records.insert(address.grain_id.clone(), address.clone());
        address
    }

    /// Record for `grain`.
    pub fn lookup(&self, grain: &GrainId) -> Option<GrainAddress> {
        self.records.borrow().get(grain).cloned()
    }

    /// Remove `address` if it is the registered activation.
    pub fn unregister(&self, address: &GrainAddress) -> bool {
        let mut records = self.records.borrow_mut();
        match records.get(&address.grain_id) {
            Some(existing) if existing.matches(address) => {
                records.remove(&address.grain_id);
                true
            }
            _ => false,
        }
    }

    /// Remove every record hosted on one of `silos`.
    pub fn unregister_silos(&self, silos: &[SiloAddress]) -> Vec<GrainAddress> {
        let mut removed = Vec::new();
        self.records.borrow_mut().retain(|_, record| {
            if silos.contains(&record.silo) {
                removed.push(record.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove and return every record whose grain satisfies `predicate`.
    pub fn take_matching(&self, predicate: impl Fn(&GrainId) -> bool) -> Vec<GrainAddress> {
        let mut taken = Vec::new();
        self.records.borrow_mut().retain(|grain, record| {
            if predicate(grain) {
                taken.push(record.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Copy every record whose grain satisfies `predicate`.
    pub fn matching(&self, predicate: impl Fn(&GrainId) -> bool) -> Vec<GrainAddress> {
        self.records
            .borrow()
            .iter()
            .filter(|(grain, _)| predicate(grain))
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Merge records received in a handoff.
    ///
    /// When two different activations meet for the same grain, the lower
    /// [`ActivationId`](crate::types::ActivationId) is kept. Returns the
    /// records that lost; their activations must be deactivated.
    pub fn merge(&self, incoming: Vec<GrainAddress>) -> Vec<GrainAddress> {
        let mut records = self.records.borrow_mut();
        let mut losers = Vec::new();
        for record in incoming {
            match records.get(&record.grain_id) {
                None => {
                    records.insert(record.grain_id.clone(), record);
                }
                Some(existing) if existing.matches(&record) => {}
                Some(existing) if record.activation_id < existing.activation_id => {
                    losers.push(existing.clone());
                    records.insert(record.grain_id.clone(), record);
                }
                Some(_) => losers.push(record),
            }
        }
        losers
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    /// Whether the partition is empty.
    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// Copy of every record.
    pub fn all(&self) -> Vec<GrainAddress> {
        self.records.borrow().values().cloned().collect()
    }
}
