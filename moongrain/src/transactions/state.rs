//! Typed transactional state owned by one grain activation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    ParticipantId, PendingWrite, ResourceRegistry, StateKey, TransactionContext, TransactionError,
    TransactionId, TransactionLog, TransactionalResource, TransactionalStateStorage,
};
use crate::error::{GrainError, StorageError};
use crate::time::TimeProvider;

struct Access<T> {
    read_version: u64,
    write: Option<T>,
    opened_at: Duration,
}

struct Inner<T> {
    committed: T,
    version: u64,
    pending: HashMap<TransactionId, Access<T>>,
    prepared: Option<TransactionId>,
}

/// A grain's transactional value.
///
/// Each open transaction gets its own buffered copy: reads see the
/// transaction's own writes, nothing reaches storage before prepare, and
/// an abort just drops the buffer. A buffer older than the transaction
/// timeout is dropped when the next transaction touches the state, unless
/// it is prepared; its coordinator aborts the transaction anyway.
pub struct TransactionalState<T> {
    participant: ParticipantId,
    key: StateKey,
    storage: Rc<dyn TransactionalStateStorage>,
    time: Rc<dyn TimeProvider>,
    timeout: Duration,
    inner: RefCell<Inner<T>>,
}

impl<T> TransactionalState<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + 'static,
{
    /// Load the state, settling any write left prepared by a previous
    /// activation: promoted if the log holds its commit, cancelled
    /// otherwise.
    pub async fn load(
        participant: ParticipantId,
        storage: Rc<dyn TransactionalStateStorage>,
        log: &dyn TransactionLog,
        time: Rc<dyn TimeProvider>,
        timeout: Duration,
    ) -> Result<Rc<Self>, GrainError> {
        let key = StateKey::new(participant.grain.clone(), participant.name.clone());
        let mut stored = storage.load(&key).await?;

        if let Some(pending) = stored.pending.take() {
            match log.lookup(pending.transaction).await? {
                Some(record) => {
                    storage.confirm(&key, record.sequence).await?;
                    tracing::info!(state = %key, transaction = %pending.transaction, sequence = record.sequence, "promoted committed write on load");
                    stored.committed = Some(pending.value);
                    stored.version = pending.sequence;
                }
                None => {
                    storage.cancel(&key, pending.transaction).await?;
                    tracing::info!(state = %key, transaction = %pending.transaction, "discarded uncommitted write on load");
                }
            }
        }

        let committed = match stored.committed {
            Some(value) => crate::codec::from_value(value)?,
            None => T::default(),
        };
        Ok(Rc::new(Self {
            participant,
            key,
            storage,
            time,
            timeout,
            inner: RefCell::new(Inner {
                committed,
                version: stored.version,
                pending: HashMap::new(),
                prepared: None,
            }),
        }))
    }

    /// Make this state reachable by transaction coordinators.
    pub fn register(self: &Rc<Self>, registry: &ResourceRegistry) {
        let resource: Rc<dyn TransactionalResource> = self.clone();
        registry.register(
            self.participant.grain.clone(),
            self.participant.name.clone(),
            Rc::downgrade(&resource),
        );
    }

    /// Participant identity.
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Last committed value.
    pub fn committed(&self) -> T {
        self.inner.borrow().committed.clone()
    }

    /// Sequence of the last commit (0 if none).
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    /// Transactions with a buffered read or write here.
    pub fn open_transactions(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Buffer of `id`, after dropping the unprepared buffers that outlived
    /// the transaction timeout.
    fn open<'a>(
        &self,
        pending: &'a mut HashMap<TransactionId, Access<T>>,
        version: u64,
        prepared: Option<TransactionId>,
        id: TransactionId,
    ) -> &'a mut Access<T> {
        let now = self.time.now();
        if !pending.contains_key(&id) {
            let before = pending.len();
            pending.retain(|tx, access| {
                Some(*tx) == prepared || now.saturating_sub(access.opened_at) <= self.timeout
            });
            let expired = before - pending.len();
            if expired > 0 {
                tracing::debug!(state = %self.key, expired, "dropped expired transaction buffers");
            }
        }
        pending.entry(id).or_insert(Access {
            read_version: version,
            write: None,
            opened_at: now,
        })
    }

    fn transaction(ctx: &TransactionContext) -> Result<TransactionId, TransactionError> {
        let info = ctx.borrow();
        match &info.abort_cause {
            Some(cause) => Err(TransactionError::Aborted {
                transaction: info.id,
                cause: cause.clone(),
            }),
            None => Ok(info.id),
        }
    }

    /// Read the value as seen by the transaction in `ctx`.
    pub fn perform_read<R>(
        &self,
        ctx: &TransactionContext,
        read: impl FnOnce(&T) -> R,
    ) -> Result<R, TransactionError> {
        let id = Self::transaction(ctx)?;
        let result = {
            let mut inner = self.inner.borrow_mut();
            let Inner {
                committed,
                version,
                pending,
                prepared,
            } = &mut *inner;
            let access = self.open(pending, *version, *prepared, id);
            match &access.write {
                Some(value) => read(value),
                None => read(&*committed),
            }
        };
        ctx.borrow_mut().record_read(&self.participant);
        Ok(result)
    }

    /// Update the transaction's copy of the value.
    pub fn perform_update<R>(
        &self,
        ctx: &TransactionContext,
        update: impl FnOnce(&mut T) -> R,
    ) -> Result<R, TransactionError> {
        let id = Self::transaction(ctx)?;
        let result = {
            let mut inner = self.inner.borrow_mut();
            let Inner {
                committed,
                version,
                pending,
                prepared,
            } = &mut *inner;
            let access = self.open(pending, *version, *prepared, id);
            let value = access.write.get_or_insert_with(|| committed.clone());
            update(value)
        };
        ctx.borrow_mut().record_write(&self.participant);
        Ok(result)
    }

    fn inconsistent(&self, reason: String) -> TransactionError {
        TransactionError::InconsistentState {
            participant: self.participant.to_string(),
            reason,
        }
    }
}

#[async_trait::async_trait(?Send)]
impl<T> TransactionalResource for TransactionalState<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + 'static,
{
    async fn prepare(
        &self,
        transaction: TransactionId,
        sequence: u64,
    ) -> Result<(), TransactionError> {
        let (expected, write) = {
            let inner = self.inner.borrow();
            let Some(access) = inner.pending.get(&transaction) else {
                return Err(self.inconsistent(format!("no record of {transaction}")));
            };
            if access.read_version != inner.version {
                return Err(self.inconsistent(format!(
                    "read at version {} but version {} committed since",
                    access.read_version, inner.version
                )));
            }
            if let Some(other) = inner.prepared {
                if other != transaction {
                    return Err(self.inconsistent(format!("{other} is already prepared")));
                }
            }
            (inner.version, access.write.clone())
        };

        let Some(value) = write else {
            return Ok(());
        };
        let value = serde_json::to_value(&value)
            .map_err(|e| TransactionError::Storage(StorageError::Failed(e.to_string())))?;
        self.storage
            .prepare_write(
                &self.key,
                expected,
                PendingWrite {
                    transaction,
                    sequence,
                    value,
                },
            )
            .await
            .map_err(|e| match e {
                StorageError::Conflict(reason) => self.inconsistent(reason),
                other => TransactionError::Storage(other),
            })?;
        self.inner.borrow_mut().prepared = Some(transaction);
        tracing::debug!(state = %self.key, transaction = %transaction, sequence, "prepared");
        Ok(())
    }

    async fn confirm(
        &self,
        transaction: TransactionId,
        sequence: u64,
    ) -> Result<(), TransactionError> {
        let write = match self.inner.borrow().pending.get(&transaction) {
            Some(access) => access.write.clone(),
            None if self.inner.borrow().version >= sequence => return Ok(()),
            None => return Err(self.inconsistent(format!("no record of {transaction}"))),
        };

        let Some(value) = write else {
            self.inner.borrow_mut().pending.remove(&transaction);
            return Ok(());
        };

        // The decision is durable, so memory moves on even if storage lags;
        // the next load promotes the logged write.
        let stored = self.storage.confirm(&self.key, sequence).await;
        {
            let mut inner = self.inner.borrow_mut();
            inner.committed = value;
            inner.version = sequence;
            inner.pending.remove(&transaction);
            if inner.prepared == Some(transaction) {
                inner.prepared = None;
            }
        }
        tracing::debug!(state = %self.key, transaction = %transaction, sequence, "confirmed");
        stored.map_err(TransactionError::Storage)
    }

    async fn abort(&self, transaction: TransactionId) {
        let was_prepared = {
            let mut inner = self.inner.borrow_mut();
            inner.pending.remove(&transaction);
            if inner.prepared == Some(transaction) {
                inner.prepared = None;
                true
            } else {
                false
            }
        };
        if was_prepared {
            if let Err(e) = self.storage.cancel(&self.key, transaction).await {
                tracing::warn!(state = %self.key, transaction = %transaction, error = %e, "cancel failed");
            }
        }
        tracing::debug!(state = %self.key, transaction = %transaction, "aborted");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::transactions::{
        AbortCause, CommitRecord, InMemoryTransactionLog, InMemoryTransactionalStorage,
        TransactionInfo,
    };
    use crate::time::TokioTimeProvider;
    use crate::types::{GrainId, GrainType, SiloAddress};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn participant(key: &str) -> ParticipantId {
        ParticipantId {
            grain: GrainId::new(GrainType(0xACC), key),
            name: "balance".into(),
            silo: SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1, 1),
        }
    }

    fn tx(id: u64) -> TransactionContext {
        Rc::new(RefCell::new(TransactionInfo::new(
            TransactionId(id),
            Duration::ZERO,
        )))
    }

    async fn balance(
        storage: &Rc<InMemoryTransactionalStorage>,
        log: &InMemoryTransactionLog,
    ) -> Rc<TransactionalState<i64>> {
        let storage: Rc<dyn TransactionalStateStorage> = storage.clone();
        TransactionalState::load(
            participant("a"),
            storage,
            log,
            Rc::new(TokioTimeProvider::new()),
            TIMEOUT,
        )
        .await
        .expect("load")
    }

    #[tokio::test]
    async fn test_update_is_private_until_confirm() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let state = balance(&storage, &log).await;
        let t1 = tx(1);
        let t2 = tx(2);

        state.perform_update(&t1, |b| *b += 10).expect("update");
        assert_eq!(state.perform_read(&t1, |b| *b).expect("read"), 10);
        assert_eq!(state.perform_read(&t2, |b| *b).expect("read"), 0);
        assert_eq!(state.committed(), 0);

        state.prepare(TransactionId(1), 1).await.expect("prepare");
        state.confirm(TransactionId(1), 1).await.expect("confirm");
        assert_eq!(state.committed(), 10);
        assert_eq!(state.version(), 1);
        assert_eq!(
            t1.borrow().participants[&participant("a")].writes,
            1
        );
    }

    #[tokio::test]
    async fn test_stale_read_fails_prepare() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let state = balance(&storage, &log).await;
        let t1 = tx(1);
        let t2 = tx(2);

        state.perform_update(&t1, |b| *b += 1).expect("update");
        state.perform_update(&t2, |b| *b += 2).expect("update");

        state.prepare(TransactionId(1), 1).await.expect("prepare");
        let second = state.prepare(TransactionId(2), 2).await;
        assert!(matches!(second, Err(TransactionError::InconsistentState { .. })));

        state.confirm(TransactionId(1), 1).await.expect("confirm");
        let after = state.prepare(TransactionId(2), 2).await;
        assert!(matches!(after, Err(TransactionError::InconsistentState { .. })));
        state.abort(TransactionId(2)).await;
        assert_eq!(state.committed(), 1);
    }

    #[tokio::test]
    async fn test_abort_restores_committed_value() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let state = balance(&storage, &log).await;
        let t1 = tx(1);

        state.perform_update(&t1, |b| *b = 99).expect("update");
        state.prepare(TransactionId(1), 1).await.expect("prepare");
        state.abort(TransactionId(1)).await;

        assert_eq!(state.committed(), 0);
        assert!(storage
            .snapshot(&StateKey::new(participant("a").grain, "balance"))
            .pending
            .is_none());
        assert_eq!(state.perform_read(&tx(3), |b| *b).expect("read"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_buffers_expire() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let state = balance(&storage, &log).await;

        state.perform_update(&tx(1), |b| *b += 1).expect("update");
        state.perform_read(&tx(2), |b| *b).expect("read");
        state.perform_update(&tx(3), |b| *b += 3).expect("update");
        state.prepare(TransactionId(3), 1).await.expect("prepare");
        assert_eq!(state.open_transactions(), 3);

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
        state.perform_read(&tx(4), |b| *b).expect("read");

        // The prepared buffer waits for its decision.
        assert_eq!(state.open_transactions(), 2);
        state.confirm(TransactionId(3), 1).await.expect("confirm");
        assert_eq!(state.committed(), 3);
        assert!(matches!(
            state.prepare(TransactionId(1), 2).await,
            Err(TransactionError::InconsistentState { .. })
        ));
    }

    #[tokio::test]
    async fn test_doomed_transaction_cannot_touch_state() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let state = balance(&storage, &log).await;
        let t1 = tx(1);
        t1.borrow_mut().record_abort(AbortCause::Timeout);

        let result = state.perform_update(&t1, |b| *b = 1);
        assert!(matches!(result, Err(TransactionError::Aborted { .. })));
    }

    #[tokio::test]
    async fn test_load_promotes_logged_commit() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let key = StateKey::new(participant("a").grain, "balance");
        storage
            .prepare_write(
                &key,
                0,
                PendingWrite {
                    transaction: TransactionId(8),
                    sequence: 3,
                    value: json!(42),
                },
            )
            .await
            .expect("prepare");
        log.record_commit(CommitRecord {
            transaction: TransactionId(8),
            sequence: 3,
            writers: vec![participant("a")],
        })
        .await
        .expect("commit");

        let state = balance(&storage, &log).await;
        assert_eq!(state.committed(), 42);
        assert_eq!(state.version(), 3);
        assert_eq!(storage.snapshot(&key).committed, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_load_presumes_abort_without_commit_record() {
        let storage = Rc::new(InMemoryTransactionalStorage::new());
        let log = InMemoryTransactionLog::new();
        let key = StateKey::new(participant("a").grain, "balance");
        storage
            .prepare_write(
                &key,
                0,
                PendingWrite {
                    transaction: TransactionId(8),
                    sequence: 3,
                    value: json!(42),
                },
            )
            .await
            .expect("prepare");

        let state = balance(&storage, &log).await;
        assert_eq!(state.committed(), 0);
        assert!(storage.snapshot(&key).pending.is_none());
    }
}
