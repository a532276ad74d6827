//! Error types shared across subsystems.
//!
//! Each subsystem owns its own error enum next to its code
//! ([`MembershipError`], [`DirectoryError`], [`TransactionError`], ...).
//! [`GrainError`] is what a grain call returns: it aggregates them so a
//! caller can tell a transaction abort from an unreachable silo, and it is
//! serializable so the exact variant survives the trip back from a
//! remote silo.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::membership::MembershipError;
use crate::placement::PlacementError;
use crate::reminders::ReminderError;
use crate::transactions::TransactionError;
use crate::transport::TransportError;
use crate::types::{ActivationId, GrainId, GrainType, SiloAddress};

/// Failure of a pluggable storage backend (state storage, transaction log,
/// reminder table).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StorageError {
    /// Fault injected at the named site.
    #[error("injected fault at {site}")]
    Injected {
        /// Fault site that fired.
        site: String,
    },

    /// Optimistic write lost against a newer version.
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// Backend-specific failure.
    #[error("storage failed: {0}")]
    Failed(String),
}

/// Error returned by grain calls and silo operations.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum GrainError {
    /// Membership failure.
    #[error("membership: {0}")]
    Membership(#[from] MembershipError),

    /// Transport failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Directory failure.
    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),

    /// Placement failure.
    #[error("placement: {0}")]
    Placement(#[from] PlacementError),

    /// Transaction failure.
    #[error("transaction: {0}")]
    Transaction(#[from] TransactionError),

    /// Reminder failure.
    #[error("reminder: {0}")]
    Reminder(#[from] ReminderError),

    /// Storage failure outside a transaction.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Body (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// No factory registered for the grain type.
    #[error("unknown grain type {grain_type}")]
    UnknownGrainType {
        /// The unregistered type.
        grain_type: GrainType,
    },

    /// The grain does not implement the method.
    #[error("unknown method {method} on {grain}")]
    UnknownMethod {
        /// Target grain.
        grain: GrainId,
        /// Method name.
        method: String,
    },

    /// The addressed activation is not on the target silo.
    #[error("activation {activation} of {grain} not found")]
    ActivationNotFound {
        /// Target grain.
        grain: GrainId,
        /// The activation the caller expected.
        activation: ActivationId,
    },

    /// Routing loop protection.
    #[error("too many forwards for {grain} (max: {max})")]
    TooManyForwards {
        /// Target grain.
        grain: GrainId,
        /// Forward limit.
        max: u32,
    },

    /// The silo is stopping or stopped.
    #[error("silo {silo} is not running")]
    SiloStopped {
        /// The silo.
        silo: SiloAddress,
    },

    /// The call observed its cancellation token.
    #[error("call cancelled")]
    Cancelled,

    /// Activation hook failed.
    #[error("activation of {grain} failed: {reason}")]
    ActivationFailed {
        /// The grain.
        grain: GrainId,
        /// What went wrong.
        reason: String,
    },

    /// Error raised by grain code.
    #[error("{0}")]
    Application(String),
}

impl GrainError {
    /// Whether the caller should drop its cached address and retry.
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            GrainError::ActivationNotFound { .. }
                | GrainError::Transport(_)
                | GrainError::SiloStopped { .. }
        )
    }
}
