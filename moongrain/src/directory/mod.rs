//! Grain directory: which activation of each grain lives where.
//!
//! The directory is the cluster's "phone book". Given a [`GrainId`] it
//! returns the single [`GrainAddress`] (silo + activation) currently
//! responsible for that grain.
//!
//! # Design
//!
//! - [`GrainDirectory`] is the pluggable contract: `register` returns the
//!   winning record (the caller's, or the one already present), `unregister`
//!   removes a record only if the activation id matches, and
//!   `unregister_silos` purges records hosted on dead silos.
//! - [`DistributedGrainDirectory`] is the default implementation. Each silo
//!   owns the [`DirectoryPartition`] for the ring arcs ending at its point;
//!   all operations for a grain are routed to the partition owner, which
//!   serializes them in arrival order.
//! - [`InMemoryGrainDirectory`] is a single shared store, standing in for an
//!   external backend.
//! - [`DirectoryCache`] is the per-silo lookup cache, stamped with the
//!   membership version each entry was learned at.

mod cache;
mod distributed;
mod memory;
mod options;
mod partition;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::{CachedAddress, DirectoryCache};
pub use distributed::{DirectoryRequest, DirectoryResponse, DistributedGrainDirectory};
pub use memory::InMemoryGrainDirectory;
pub use options::DirectoryOptions;
pub use partition::DirectoryPartition;

use crate::types::{GrainAddress, GrainId, SiloAddress};

/// Errors from directory operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DirectoryError {
    /// No Active silo owns the grain's partition.
    #[error("no directory owner for {grain}")]
    NoOwner {
        /// The grain.
        grain: GrainId,
    },

    /// The partition owner could not be reached within the hop budget.
    #[error("directory unavailable for {grain} after {attempts} attempts")]
    Unavailable {
        /// The grain.
        grain: GrainId,
        /// Attempts made.
        attempts: u32,
    },

    /// The owner answered with a reply of the wrong kind.
    #[error("unexpected directory response from {silo}")]
    UnexpectedResponse {
        /// The answering silo.
        silo: SiloAddress,
    },
}

/// Cluster-wide map from grain identity to its single activation.
#[async_trait::async_trait(?Send)]
pub trait GrainDirectory: fmt::Debug {
    /// Register `address`. Returns the winning record: `address` itself if
    /// it was accepted, otherwise the record already in place.
    async fn register(&self, address: GrainAddress) -> Result<GrainAddress, DirectoryError>;

    /// Current record for `grain`, if any.
    async fn lookup(&self, grain: &GrainId) -> Result<Option<GrainAddress>, DirectoryError>;

    /// Remove `address` if it is still the registered activation.
    async fn unregister(&self, address: &GrainAddress) -> Result<(), DirectoryError>;

    /// Remove every record hosted on one of `silos`.
    async fn unregister_silos(&self, silos: &[SiloAddress]) -> Result<(), DirectoryError>;
}
