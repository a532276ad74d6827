//! Transaction participants and the per-silo registry the coordinator
//! reaches them through.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use super::{ParticipantId, TransactionError, TransactionId};
use crate::types::GrainId;

/// Phase-two operations a coordinator drives on a participant.
#[async_trait::async_trait(?Send)]
pub trait TransactionalResource {
    /// Validate and durably record the transaction's write, if any.
    async fn prepare(
        &self,
        transaction: TransactionId,
        sequence: u64,
    ) -> Result<(), TransactionError>;

    /// Make the prepared write authoritative.
    async fn confirm(
        &self,
        transaction: TransactionId,
        sequence: u64,
    ) -> Result<(), TransactionError>;

    /// Discard everything the transaction did here.
    async fn abort(&self, transaction: TransactionId);
}

/// What the coordinator asks a participant to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    /// Phase one.
    Prepare {
        /// Commit sequence.
        sequence: u64,
    },
    /// Phase two, commit.
    Confirm {
        /// Commit sequence.
        sequence: u64,
    },
    /// Phase two, abort.
    Abort,
}

/// A [`ResourceAction`] addressed to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Target participant.
    pub participant: ParticipantId,
    /// The transaction.
    pub transaction: TransactionId,
    /// What to do.
    pub action: ResourceAction,
}

/// Transactional states of the activations on one silo.
///
/// States register themselves when loaded and are held weakly, so a
/// deactivated grain's state disappears from the registry on its own.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: RefCell<HashMap<(GrainId, String), Weak<dyn TransactionalResource>>>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.resources.borrow().len())
            .finish()
    }
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` as state `name` of `grain`.
    pub fn register(
        &self,
        grain: GrainId,
        name: String,
        resource: Weak<dyn TransactionalResource>,
    ) {
        self.resources.borrow_mut().insert((grain, name), resource);
    }

    /// Drop every state of `grain`.
    pub fn unregister_grain(&self, grain: &GrainId) {
        self.resources.borrow_mut().retain(|(g, _), _| g != grain);
    }

    /// Live resource for `participant`.
    pub fn get(&self, participant: &ParticipantId) -> Option<Rc<dyn TransactionalResource>> {
        self.resources
            .borrow()
            .get(&(participant.grain.clone(), participant.name.clone()))
            .and_then(Weak::upgrade)
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.resources
            .borrow()
            .values()
            .filter(|r| r.strong_count() > 0)
            .count()
    }

    /// Whether no resource is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `request` to the local resource it names.
    pub async fn handle(&self, request: ResourceRequest) -> Result<(), TransactionError> {
        let Some(resource) = self.get(&request.participant) else {
            return match request.action {
                // Nothing left to discard.
                ResourceAction::Abort => Ok(()),
                _ => Err(TransactionError::ParticipantNotFound {
                    participant: request.participant.to_string(),
                }),
            };
        };
        match request.action {
            ResourceAction::Prepare { sequence } => {
                resource.prepare(request.transaction, sequence).await
            }
            ResourceAction::Confirm { sequence } => {
                resource.confirm(request.transaction, sequence).await
            }
            ResourceAction::Abort => {
                resource.abort(request.transaction).await;
                Ok(())
            }
        }
    }
}
