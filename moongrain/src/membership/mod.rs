//! Cluster membership: the table, the oracle and the failure detector.
//!
//! # Design
//!
//! - [`MembershipTable`] is the only shared mutable resource. It is written
//!   exclusively through version compare-and-swap, never through locks, so
//!   no silo acts as a coordinator and no lock needs recovering when a silo
//!   dies.
//! - [`MembershipOracle`] is the single process-scoped view of the cluster
//!   for one silo. It joins, heartbeats, records suspicion votes, and
//!   publishes every newer [`MembershipSnapshot`] on a `watch` channel that
//!   the directory, the reminder service and the catalog subscribe to.
//! - [`FailureDetector`] probes the silo's ring successors and turns missed
//!   probes into suspicion votes. A silo is declared dead only once a quorum
//!   of distinct, fresh votes exists in its row.

mod detector;
mod options;
mod oracle;
mod snapshot;
mod table;

use serde::{Deserialize, Serialize};

pub use detector::FailureDetector;
pub use options::{MembershipOptions, QuorumPolicy};
pub use oracle::MembershipOracle;
pub use snapshot::MembershipSnapshot;
pub use table::{
    InMemoryMembershipTable, MembershipEntry, MembershipTable, MembershipTableData,
    MembershipVersion, SiloStatus, SuspectVote,
};

use crate::types::SiloAddress;

/// Errors from membership operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MembershipError {
    /// The write was based on a stale table version.
    #[error("version conflict: expected {expected}, table is at {actual}")]
    VersionConflict {
        /// Version the writer observed.
        expected: MembershipVersion,
        /// Version the table is at.
        actual: MembershipVersion,
    },

    /// A row for this silo already exists.
    #[error("silo {silo} already has a membership row")]
    AlreadyExists {
        /// The silo.
        silo: SiloAddress,
    },

    /// No row for this silo.
    #[error("silo {silo} has no membership row")]
    NotFound {
        /// The silo.
        silo: SiloAddress,
    },

    /// The silo has been declared dead.
    #[error("silo {silo} is dead")]
    SiloDead {
        /// The silo.
        silo: SiloAddress,
    },

    /// The retry budget for a status transition ran out.
    #[error("membership update for {silo} failed after {attempts} attempts")]
    UpdateFailed {
        /// The silo whose row was being written.
        silo: SiloAddress,
        /// Attempts made.
        attempts: u32,
    },

    /// Backend failure.
    #[error("membership storage: {0}")]
    Storage(String),
}

impl MembershipError {
    /// Whether a re-read and retry can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MembershipError::VersionConflict { .. } | MembershipError::Storage(_)
        )
    }
}
