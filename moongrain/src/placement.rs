//! Placement: per-grain-type strategies and the silo chooser.
//!
//! Placement separates two concerns:
//!
//! - **[`PlacementStrategy`]**: data declared per grain type, saying *what*
//!   the grain wants (consistent hash, local, a fixed silo, ...).
//! - **[`PlacementDirector`]**: the algorithm that interprets the strategy
//!   against the current Active silo list and returns a concrete silo.
//!
//! The director is a pure function of its inputs plus its own small
//! round-robin/random state. Callers pass the Active silos from the current
//! membership snapshot; a non-Active silo is never returned.

use std::cell::{Cell, RefCell};
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::ring::ConsistentRing;
use crate::types::{GrainId, SiloAddress};

/// Errors from placement operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PlacementError {
    /// No Active silo to place on.
    #[error("no active silos available to place {grain}")]
    NoActiveSilos {
        /// The grain that could not be placed.
        grain: GrainId,
    },

    /// The requested silo is not Active.
    #[error("silo {silo} is not active, cannot place {grain}")]
    SiloNotActive {
        /// The grain that could not be placed.
        grain: GrainId,
        /// The requested silo.
        silo: SiloAddress,
    },
}

/// Per-grain-type placement hint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementStrategy {
    /// Silo owning the grain's hash on the ring of Active silos.
    #[default]
    ConsistentHash,
    /// The calling silo, falling back to consistent hash if it is not Active.
    PreferLocal,
    /// A uniformly random Active silo.
    Random,
    /// Active silos in turn.
    RoundRobin,
    /// A fixed silo; placement fails if it is not Active.
    Explicit(SiloAddress),
    /// Unregistered replicas on the calling silo, up to `max_local` of them.
    StatelessWorker {
        /// Maximum replicas per silo.
        max_local: usize,
    },
}

impl PlacementStrategy {
    /// Whether activations under this strategy skip the grain directory.
    pub fn is_stateless(&self) -> bool {
        matches!(self, PlacementStrategy::StatelessWorker { .. })
    }
}

/// Chooses the silo that should host a new activation.
pub trait PlacementDirector: fmt::Debug {
    /// Choose a silo for `grain`.
    ///
    /// `candidates` are the Active silos of the caller's current view, sorted
    /// by address; `local` is the calling silo.
    fn choose_silo(
        &self,
        grain: &GrainId,
        strategy: &PlacementStrategy,
        local: &SiloAddress,
        candidates: &[SiloAddress],
    ) -> Result<SiloAddress, PlacementError>;
}

/// Built-in director handling every [`PlacementStrategy`].
#[derive(Debug)]
pub struct DefaultPlacementDirector {
    round_robin_next: Cell<usize>,
    rng: RefCell<ChaCha8Rng>,
}

impl DefaultPlacementDirector {
    /// Director whose `Random` choices follow `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            round_robin_next: Cell::new(0),
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

impl Default for DefaultPlacementDirector {
    fn default() -> Self {
        Self::with_seed(rand::random())
    }
}

impl PlacementDirector for DefaultPlacementDirector {
    fn choose_silo(
        &self,
        grain: &GrainId,
        strategy: &PlacementStrategy,
        local: &SiloAddress,
        candidates: &[SiloAddress],
    ) -> Result<SiloAddress, PlacementError> {
        if candidates.is_empty() {
            return Err(PlacementError::NoActiveSilos {
                grain: grain.clone(),
            });
        }
        let local_active = candidates.contains(local);

        let chosen = match strategy {
            PlacementStrategy::ConsistentHash => consistent_hash(grain, candidates),
            PlacementStrategy::PreferLocal if local_active => Some(local.clone()),
            PlacementStrategy::PreferLocal => consistent_hash(grain, candidates),
            PlacementStrategy::Random => {
                let index = self.rng.borrow_mut().random_range(0..candidates.len());
                Some(candidates[index].clone())
            }
            PlacementStrategy::RoundRobin => {
                let index = self.round_robin_next.get() % candidates.len();
                self.round_robin_next.set(index + 1);
                Some(candidates[index].clone())
            }
            PlacementStrategy::Explicit(silo) => {
                if !candidates.contains(silo) {
                    return Err(PlacementError::SiloNotActive {
                        grain: grain.clone(),
                        silo: silo.clone(),
                    });
                }
                Some(silo.clone())
            }
            PlacementStrategy::StatelessWorker { .. } => {
                if !local_active {
                    return Err(PlacementError::SiloNotActive {
                        grain: grain.clone(),
                        silo: local.clone(),
                    });
                }
                Some(local.clone())
            }
        };

        chosen.ok_or_else(|| PlacementError::NoActiveSilos {
            grain: grain.clone(),
        })
    }
}

fn consistent_hash(grain: &GrainId, candidates: &[SiloAddress]) -> Option<SiloAddress> {
    ConsistentRing::from_silos(candidates, 1)
        .owner_of(grain)
        .cloned()
}
