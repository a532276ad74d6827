//! Per-activation and per-call context handed to grain code.

use std::cell::Cell;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{GrainCancellationToken, GrainRef, Silo};
use crate::error::GrainError;
use crate::reminders::{ReminderEntry, ReminderHandle};
use crate::transactions::{ParticipantId, TransactionContext, TransactionError, TransactionalState};
use crate::types::{ActivationId, GrainAddress, GrainId, GrainKey, GrainType, SiloAddress};

/// What an activation knows about itself and its silo.
pub struct GrainContext {
    address: GrainAddress,
    silo: Weak<Silo>,
    deactivate: Cell<bool>,
}

impl std::fmt::Debug for GrainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrainContext")
            .field("address", &self.address)
            .field("deactivate", &self.deactivate.get())
            .finish()
    }
}

impl GrainContext {
    pub(crate) fn new(address: GrainAddress, silo: Weak<Silo>) -> Self {
        Self {
            address,
            silo,
            deactivate: Cell::new(false),
        }
    }

    /// The grain.
    pub fn grain_id(&self) -> &GrainId {
        &self.address.grain_id
    }

    /// This activation.
    pub fn activation_id(&self) -> ActivationId {
        self.address.activation_id
    }

    /// Directory record of this activation.
    pub fn address(&self) -> &GrainAddress {
        &self.address
    }

    /// Hosting silo.
    pub fn silo_address(&self) -> &SiloAddress {
        &self.address.silo
    }

    fn silo(&self) -> Result<Rc<Silo>, GrainError> {
        self.silo.upgrade().ok_or_else(|| GrainError::SiloStopped {
            silo: self.address.silo.clone(),
        })
    }

    /// Cluster clock.
    pub fn now(&self) -> Duration {
        self.silo().map(|silo| silo.now()).unwrap_or_default()
    }

    /// Reference to another grain, outside any transaction.
    pub fn grain(&self, grain_type: GrainType, key: impl Into<GrainKey>) -> GrainRef {
        GrainRef::new(
            GrainId::new(grain_type, key),
            self.silo.clone(),
            self.address.silo.clone(),
        )
    }

    /// Load transactional state `name` of this grain and make it visible to
    /// transaction coordinators.
    pub async fn transactional_state<T>(
        &self,
        name: &str,
    ) -> Result<Rc<TransactionalState<T>>, GrainError>
    where
        T: Serialize + DeserializeOwned + Clone + Default + 'static,
    {
        let silo = self.silo()?;
        let participant = ParticipantId {
            grain: self.address.grain_id.clone(),
            name: name.to_string(),
            silo: self.address.silo.clone(),
        };
        let coordinator = silo.coordinator();
        let state = TransactionalState::load(
            participant,
            silo.state_storage().clone(),
            silo.transaction_log().as_ref(),
            coordinator.time().clone(),
            coordinator.options().transaction_timeout,
        )
        .await?;
        state.register(silo.resources());
        Ok(state)
    }

    /// Create or replace reminder `name`. The first tick is `due` from now,
    /// then every `period`.
    pub async fn register_or_update_reminder(
        &self,
        name: &str,
        due: Duration,
        period: Duration,
    ) -> Result<ReminderHandle, GrainError> {
        let silo = self.silo()?;
        Ok(silo
            .reminders()
            .register_or_update(self.grain_id(), name, due, period)
            .await?)
    }

    /// Remove a reminder registered earlier.
    pub async fn unregister_reminder(&self, handle: &ReminderHandle) -> Result<(), GrainError> {
        Ok(self.silo()?.reminders().unregister(handle).await?)
    }

    /// Reminder `name` of this grain, if registered.
    pub async fn get_reminder(&self, name: &str) -> Result<Option<ReminderEntry>, GrainError> {
        Ok(self
            .silo()?
            .reminders()
            .get_reminder(self.grain_id(), name)
            .await?)
    }

    /// Every reminder of this grain.
    pub async fn get_reminders(&self) -> Result<Vec<ReminderEntry>, GrainError> {
        Ok(self.silo()?.reminders().get_reminders(self.grain_id()).await?)
    }

    /// Deactivate once the current turn completes.
    pub fn deactivate_on_idle(&self) {
        self.deactivate.set(true);
    }

    pub(crate) fn deactivation_requested(&self) -> bool {
        self.deactivate.get()
    }
}

/// Context of one grain call: the activation plus the call's ambient
/// transaction and cancellation token.
///
/// Dereferences to [`GrainContext`].
#[derive(Debug)]
pub struct CallContext {
    grain: Rc<GrainContext>,
    transaction: Option<TransactionContext>,
    cancellation: Option<GrainCancellationToken>,
}

impl CallContext {
    pub(crate) fn new(
        grain: Rc<GrainContext>,
        transaction: Option<TransactionContext>,
        cancellation: Option<GrainCancellationToken>,
    ) -> Self {
        Self {
            grain,
            transaction,
            cancellation,
        }
    }

    /// Ambient transaction, if the call runs inside one.
    pub fn transaction(&self) -> Option<&TransactionContext> {
        self.transaction.as_ref()
    }

    /// Ambient transaction, or `NotSupported` if there is none.
    pub fn require_transaction(&self) -> Result<&TransactionContext, GrainError> {
        self.transaction.as_ref().ok_or_else(|| {
            TransactionError::NotSupported {
                reason: format!("{} called outside a transaction", self.grain.grain_id()),
            }
            .into()
        })
    }

    /// Cancellation token passed by the caller.
    pub fn cancellation(&self) -> Option<&GrainCancellationToken> {
        self.cancellation.as_ref()
    }

    /// Whether the caller asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Reference to another grain. Calls through it carry this call's
    /// transaction and cancellation token.
    pub fn grain(&self, grain_type: GrainType, key: impl Into<GrainKey>) -> GrainRef {
        let mut grain = self
            .grain
            .grain(grain_type, key)
            .with_transaction(self.transaction.clone());
        if let Some(token) = &self.cancellation {
            grain = grain.with_cancellation(token.clone());
        }
        grain
    }
}

impl Deref for CallContext {
    type Target = GrainContext;

    fn deref(&self) -> &GrainContext {
        &self.grain
    }
}
