//! Multi-grain transactions over transactional state.
//!
//! A transaction is started by the silo that first runs a method whose
//! [`TransactionOption`] demands one. Every [`TransactionalState`] touched
//! inside it registers itself as a participant in the
//! [`TransactionInfo`] that travels with each call. When the root call
//! returns, that silo's [`TransactionCoordinator`] resolves the
//! transaction.
//!
//! # Design
//!
//! - **Optimistic concurrency**: reads and writes are buffered per
//!   transaction against the last committed value. Nothing is locked. At
//!   prepare, a participant checks that nothing committed since the
//!   transaction first read it and that no other transaction is prepared.
//! - **Two-phase commit**: the coordinator allocates a commit sequence from
//!   the [`TransactionLog`], asks every participant to durably
//!   [`prepare_write`](TransactionalStateStorage::prepare_write), records
//!   the commit decision in the log, then confirms. Any prepare failure
//!   aborts every participant, which discards its buffer and cancels its
//!   prepared record.
//! - **Recovery**: on activation, a prepared record whose commit is in the
//!   log is promoted; any other prepared record is cancelled (presumed
//!   abort).

mod coordinator;
mod info;
mod log;
mod option;
mod resource;
mod state;
mod storage;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use coordinator::{TransactionCoordinator, TransactionOptions};
pub use info::{AccessCounts, ParticipantId, TransactionContext, TransactionId, TransactionInfo};
pub use log::{CommitRecord, InMemoryTransactionLog, TransactionLog};
pub use option::{TransactionOption, TransactionScope};
pub use resource::{ResourceAction, ResourceRegistry, ResourceRequest, TransactionalResource};
pub use state::TransactionalState;
pub use storage::{
    InMemoryTransactionalStorage, PendingWrite, StateKey, StoredState, TransactionalStateStorage,
};

use crate::error::StorageError;

/// Why a transaction aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AbortCause {
    /// A participant detected a conflicting commit or prepare.
    #[error("conflict at {participant}: {reason}")]
    Conflict {
        /// Participant that refused to prepare.
        participant: String,
        /// What conflicted.
        reason: String,
    },

    /// Storage failed (after retries) at a participant or in the log.
    #[error("storage failure at {participant}: {error}")]
    Storage {
        /// Participant, or `"log"` for the transaction log.
        participant: String,
        /// The last storage error.
        error: StorageError,
    },

    /// A participant could not be reached or no longer exists.
    #[error("participant {participant} unavailable")]
    Unavailable {
        /// The participant.
        participant: String,
    },

    /// The transaction ran past its timeout.
    #[error("transaction timed out")]
    Timeout,

    /// A call inside the transaction failed.
    #[error("application failure: {0}")]
    Application(String),
}

/// Errors from transactions and transactional state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransactionError {
    /// The transaction did not commit; no participant's state changed.
    #[error("transaction {transaction} aborted: {cause}")]
    Aborted {
        /// The transaction.
        transaction: TransactionId,
        /// Root cause.
        cause: AbortCause,
    },

    /// A participant's state changed under the transaction.
    #[error("inconsistent state at {participant}: {reason}")]
    InconsistentState {
        /// The participant.
        participant: String,
        /// What changed.
        reason: String,
    },

    /// The call's transaction option does not allow the ambient context.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Explanation.
        reason: String,
    },

    /// No transactional resource is registered under that name.
    #[error("participant {participant} not found")]
    ParticipantNotFound {
        /// The participant.
        participant: String,
    },

    /// Storage failure.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}
