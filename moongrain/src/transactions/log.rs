//! Transaction log: commit sequences and commit decisions.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{ParticipantId, TransactionId};
use crate::error::StorageError;
use crate::fault::FaultInjector;

/// Durable record that a transaction committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// The transaction.
    pub transaction: TransactionId,
    /// Its commit sequence.
    pub sequence: u64,
    /// Participants that wrote.
    pub writers: Vec<ParticipantId>,
}

/// Pluggable, cluster-shared transaction log.
#[async_trait::async_trait(?Send)]
pub trait TransactionLog: fmt::Debug {
    /// Next commit sequence. Strictly increasing across the cluster.
    async fn allocate_sequence(&self) -> Result<u64, StorageError>;

    /// Durably record the commit decision. After this returns `Ok`, the
    /// transaction is committed.
    async fn record_commit(&self, record: CommitRecord) -> Result<(), StorageError>;

    /// The commit record of `transaction`, if it committed.
    async fn lookup(
        &self,
        transaction: TransactionId,
    ) -> Result<Option<CommitRecord>, StorageError>;
}

/// In-memory [`TransactionLog`]. Fault site: `txlog.commit`.
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    next_sequence: Cell<u64>,
    commits: RefCell<HashMap<TransactionId, CommitRecord>>,
    faults: Option<Rc<FaultInjector>>,
}

impl InMemoryTransactionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log that consults `faults`.
    pub fn with_faults(faults: Rc<FaultInjector>) -> Self {
        Self {
            faults: Some(faults),
            ..Self::default()
        }
    }

    /// Number of committed transactions.
    pub fn committed(&self) -> usize {
        self.commits.borrow().len()
    }
}

#[async_trait::async_trait(?Send)]
impl TransactionLog for InMemoryTransactionLog {
    async fn allocate_sequence(&self) -> Result<u64, StorageError> {
        let next = self.next_sequence.get() + 1;
        self.next_sequence.set(next);
        Ok(next)
    }

    async fn record_commit(&self, record: CommitRecord) -> Result<(), StorageError> {
        if let Some(faults) = &self.faults {
            if faults.should_fail("txlog.commit") {
                return Err(StorageError::Injected {
                    site: "txlog.commit".into(),
                });
            }
        }
        self.commits
            .borrow_mut()
            .insert(record.transaction, record);
        Ok(())
    }

    async fn lookup(
        &self,
        transaction: TransactionId,
    ) -> Result<Option<CommitRecord>, StorageError> {
        Ok(self.commits.borrow().get(&transaction).cloned())
    }
}
