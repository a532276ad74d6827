//! Durable storage for transactional state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::TransactionId;
use crate::error::StorageError;
use crate::fault::FaultInjector;
use crate::types::GrainId;

/// Storage key of one transactional state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    /// Owning grain.
    pub grain: GrainId,
    /// State name within the grain.
    pub name: String,
}

impl StateKey {
    /// Key for `name` of `grain`.
    pub fn new(grain: GrainId, name: impl Into<String>) -> Self {
        Self {
            grain,
            name: name.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.grain, self.name)
    }
}

/// A tentative value written at prepare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Writing transaction.
    pub transaction: TransactionId,
    /// Commit sequence allocated to it.
    pub sequence: u64,
    /// The tentative value.
    pub value: serde_json::Value,
}

/// What storage holds for one state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Last committed value, if any commit happened.
    pub committed: Option<serde_json::Value>,
    /// Sequence of the last commit (0 if none).
    pub version: u64,
    /// Prepared but not yet confirmed write.
    pub pending: Option<PendingWrite>,
}

/// Pluggable durable log for transactional state.
#[async_trait::async_trait(?Send)]
pub trait TransactionalStateStorage: fmt::Debug {
    /// Read the committed value and any prepared write.
    async fn load(&self, key: &StateKey) -> Result<StoredState, StorageError>;

    /// Durably record a tentative write.
    ///
    /// Fails with [`StorageError::Conflict`] if the committed version is not
    /// `expected_version` or another transaction's write is pending.
    /// Re-preparing the same transaction replaces its pending write.
    async fn prepare_write(
        &self,
        key: &StateKey,
        expected_version: u64,
        write: PendingWrite,
    ) -> Result<(), StorageError>;

    /// Make the pending write with `sequence` the committed value.
    /// Confirming an already committed sequence is a no-op.
    async fn confirm(&self, key: &StateKey, sequence: u64) -> Result<(), StorageError>;

    /// Drop the pending write of `transaction`, if any.
    async fn cancel(&self, key: &StateKey, transaction: TransactionId) -> Result<(), StorageError>;
}

/// In-memory [`TransactionalStateStorage`] with fault injection.
///
/// Fault sites: `storage.load`, `storage.prepare`, `storage.confirm`, each
/// also checked with a `/{grain}` suffix first.
#[derive(Debug, Default)]
pub struct InMemoryTransactionalStorage {
    states: RefCell<HashMap<StateKey, StoredState>>,
    faults: Option<Rc<FaultInjector>>,
}

impl InMemoryTransactionalStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that consults `faults`.
    pub fn with_faults(faults: Rc<FaultInjector>) -> Self {
        Self {
            states: RefCell::default(),
            faults: Some(faults),
        }
    }

    /// Copy of what is stored under `key`.
    pub fn snapshot(&self, key: &StateKey) -> StoredState {
        self.states.borrow().get(key).cloned().unwrap_or_default()
    }

    fn check(&self, site: &str, key: &StateKey) -> Result<(), StorageError> {
        let Some(faults) = &self.faults else {
            return Ok(());
        };
        let specific = format!("{site}/{}", key.grain);
        if faults.should_fail_any(&specific, site) {
            return Err(StorageError::Injected { site: specific });
        }
        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl TransactionalStateStorage for InMemoryTransactionalStorage {
    async fn load(&self, key: &StateKey) -> Result<StoredState, StorageError> {
        self.check("storage.load", key)?;
        Ok(self.snapshot(key))
    }

    async fn prepare_write(
        &self,
        key: &StateKey,
        expected_version: u64,
        write: PendingWrite,
    ) -> Result<(), StorageError> {
        self.check("storage.prepare", key)?;
        let mut states = self.states.borrow_mut();
        let state = states.entry(key.clone()).or_default();
        if state.version != expected_version {
            return Err(StorageError::Conflict(format!(
                "{key}: expected version {expected_version}, found {}",
                state.version
            )));
        }
        if let Some(pending) = &state.pending {
            if pending.transaction != write.transaction {
                return Err(StorageError::Conflict(format!(
                    "{key}: {} already prepared",
                    pending.transaction
                )));
            }
        }
        state.pending = Some(write);
        Ok(())
    }

    async fn confirm(&self, key: &StateKey, sequence: u64) -> Result<(), StorageError> {
        self.check("storage.confirm", key)?;
        let mut states = self.states.borrow_mut();
        let state = states.entry(key.clone()).or_default();
        match state.pending.take() {
            Some(pending) if pending.sequence == sequence => {
                state.committed = Some(pending.value);
                state.version = sequence;
                Ok(())
            }
            other => {
                state.pending = other;
                if state.version >= sequence {
                    Ok(())
                } else {
                    Err(StorageError::Failed(format!(
                        "{key}: no pending write for sequence {sequence}"
                    )))
                }
            }
        }
    }

    async fn cancel(&self, key: &StateKey, transaction: TransactionId) -> Result<(), StorageError> {
        let mut states = self.states.borrow_mut();
        if let Some(state) = states.get_mut(key) {
            if state
                .pending
                .as_ref()
                .is_some_and(|p| p.transaction == transaction)
            {
                state.pending = None;
            }
        }
        Ok(())
    }
}
