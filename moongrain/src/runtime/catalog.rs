//! Activations hosted by one silo.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::activation::{Activation, ActivationState};
use super::DetailedGrainStatistic;
use crate::types::{ActivationId, GrainId, GrainType, SiloAddress};

/// Local activation table. Registered grains have at most one entry;
/// stateless workers keep a small pool per grain.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    activations: RefCell<HashMap<GrainId, Rc<Activation>>>,
    workers: RefCell<HashMap<GrainId, Vec<Rc<Activation>>>>,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The registered activation of `grain`, unless it is shutting down.
    pub(crate) fn get(&self, grain: &GrainId) -> Option<Rc<Activation>> {
        self.activations
            .borrow()
            .get(grain)
            .filter(|a| {
                matches!(
                    a.state(),
                    ActivationState::Activating | ActivationState::Valid
                )
            })
            .cloned()
    }

    /// The activation of `grain` with id `activation`, worker or not.
    pub(crate) fn get_exact(
        &self,
        grain: &GrainId,
        activation: ActivationId,
    ) -> Option<Rc<Activation>> {
        if let Some(found) = self
            .activations
            .borrow()
            .get(grain)
            .filter(|a| a.id() == activation)
        {
            return Some(found.clone());
        }
        self.workers
            .borrow()
            .get(grain)
            .and_then(|pool| pool.iter().find(|a| a.id() == activation).cloned())
    }

    pub(crate) fn insert(&self, activation: Rc<Activation>) {
        self.activations
            .borrow_mut()
            .insert(activation.grain_id().clone(), activation);
    }

    /// Pick a stateless worker for `grain`: an idle one, else a new one
    /// while the pool is below `max_local`, else the least busy.
    pub(crate) fn worker(
        &self,
        grain: &GrainId,
        max_local: usize,
        create: impl FnOnce() -> Rc<Activation>,
    ) -> Rc<Activation> {
        {
            let workers = self.workers.borrow();
            if let Some(pool) = workers.get(grain) {
                if let Some(idle) = pool.iter().find(|a| a.is_idle()) {
                    return idle.clone();
                }
                if pool.len() >= max_local.max(1) {
                    if let Some(least) = pool.iter().min_by_key(|a| a.processed()) {
                        return least.clone();
                    }
                }
            }
        }
        let activation = create();
        self.workers
            .borrow_mut()
            .entry(grain.clone())
            .or_default()
            .push(activation.clone());
        activation
    }

    /// Drop `activation` if it is still the one on record.
    pub(crate) fn remove(&self, activation: &Activation) {
        let grain = activation.grain_id();
        {
            let mut activations = self.activations.borrow_mut();
            if activations.get(grain).is_some_and(|a| a.id() == activation.id()) {
                activations.remove(grain);
                return;
            }
        }
        let mut workers = self.workers.borrow_mut();
        if let Some(pool) = workers.get_mut(grain) {
            pool.retain(|a| a.id() != activation.id());
            if pool.is_empty() {
                workers.remove(grain);
            }
        }
    }

    /// Every activation, registered ones first.
    pub(crate) fn all(&self) -> Vec<Rc<Activation>> {
        let mut all: Vec<_> = self.activations.borrow().values().cloned().collect();
        all.extend(self.workers.borrow().values().flatten().cloned());
        all
    }

    /// Empty the catalog, returning what it held.
    pub(crate) fn drain(&self) -> Vec<Rc<Activation>> {
        let mut all: Vec<_> = self.activations.borrow_mut().drain().map(|(_, a)| a).collect();
        all.extend(self.workers.borrow_mut().drain().flat_map(|(_, pool)| pool));
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.activations.borrow().len()
            + self.workers.borrow().values().map(Vec::len).sum::<usize>()
    }

    /// Management view of the catalog, optionally filtered by type.
    pub(crate) fn statistics(
        &self,
        silo: &SiloAddress,
        types: Option<&[GrainType]>,
    ) -> Vec<DetailedGrainStatistic> {
        let mut stats: Vec<_> = self
            .all()
            .into_iter()
            .filter(|a| a.state() == ActivationState::Valid)
            .filter(|a| match types {
                Some(types) => types.contains(&a.grain_id().grain_type),
                None => true,
            })
            .map(|a| DetailedGrainStatistic {
                grain_type_name: a.info().name().to_string(),
                grain_type: a.grain_id().grain_type,
                grain: a.grain_id().clone(),
                silo: silo.clone(),
                activation_id: a.id(),
            })
            .collect();
        stats.sort_by(|a, b| a.grain.cmp(&b.grain).then(a.activation_id.cmp(&b.activation_id)));
        stats
    }
}
