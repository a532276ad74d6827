//! Per-silo transaction coordinator.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    AbortCause, CommitRecord, ParticipantId, ResourceAction, ResourceRegistry, ResourceRequest,
    TransactionContext, TransactionError, TransactionId, TransactionInfo, TransactionLog,
};
use crate::error::StorageError;
use crate::time::TimeProvider;
use crate::transport::{SiloMessage, SiloReply, SiloTransport, TransportError};
use crate::types::SiloAddress;

/// Transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// A transaction older than this when it resolves aborts.
    pub transaction_timeout: Duration,
    /// Attempts per participant when prepare fails on storage.
    pub max_prepare_attempts: u32,
    /// Pause between prepare attempts.
    pub prepare_backoff: Duration,
    /// Timeout of one participant request to another silo.
    pub participant_timeout: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(30),
            max_prepare_attempts: 3,
            prepare_backoff: Duration::from_millis(100),
            participant_timeout: Duration::from_secs(5),
        }
    }
}

impl TransactionOptions {
    /// Short timeouts for tests running on a paused clock.
    pub fn for_simulation() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(10),
            max_prepare_attempts: 3,
            prepare_backoff: Duration::from_millis(10),
            participant_timeout: Duration::from_millis(500),
        }
    }
}

/// Starts transactions and runs two-phase commit for the ones rooted on
/// this silo.
pub struct TransactionCoordinator {
    local: SiloAddress,
    log: Rc<dyn TransactionLog>,
    resources: Rc<ResourceRegistry>,
    transport: Rc<dyn SiloTransport>,
    time: Rc<dyn TimeProvider>,
    options: TransactionOptions,
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("local", &self.local)
            .field("options", &self.options)
            .finish()
    }
}

impl TransactionCoordinator {
    /// Create the coordinator of `local`.
    pub fn new(
        local: SiloAddress,
        log: Rc<dyn TransactionLog>,
        resources: Rc<ResourceRegistry>,
        transport: Rc<dyn SiloTransport>,
        time: Rc<dyn TimeProvider>,
        options: TransactionOptions,
    ) -> Self {
        Self {
            local,
            log,
            resources,
            transport,
            time,
            options,
        }
    }

    /// The registry of this silo's transactional states.
    pub fn resources(&self) -> &Rc<ResourceRegistry> {
        &self.resources
    }

    /// Settings in use.
    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Clock transactions are timed on.
    pub fn time(&self) -> &Rc<dyn TimeProvider> {
        &self.time
    }

    /// Start a new transaction.
    pub fn start(&self) -> TransactionContext {
        let info = TransactionInfo::new(TransactionId::random(), self.time.now());
        tracing::debug!(silo = %self.local, transaction = %info.id, "transaction started");
        Rc::new(RefCell::new(info))
    }

    /// Commit `info`, or abort it everywhere.
    ///
    /// Returns [`TransactionError::Aborted`] with the root cause when the
    /// transaction was doomed, timed out, or failed to prepare.
    pub async fn resolve(&self, info: &TransactionInfo) -> Result<(), TransactionError> {
        if let Some(cause) = info.abort_cause.clone() {
            return Err(self.abort(info, cause).await);
        }
        if self.time.now().saturating_sub(info.start_time) > self.options.transaction_timeout {
            return Err(self.abort(info, AbortCause::Timeout).await);
        }
        if info.participants.is_empty() {
            return Ok(());
        }

        let sequence = match self.log.allocate_sequence().await {
            Ok(sequence) => sequence,
            Err(error) => {
                let cause = AbortCause::Storage {
                    participant: "log".into(),
                    error,
                };
                return Err(self.abort(info, cause).await);
            }
        };

        for participant in info.participants.keys() {
            if let Err(cause) = self.prepare(info.id, participant, sequence).await {
                return Err(self.abort(info, cause).await);
            }
        }

        let writers: Vec<ParticipantId> = info
            .participants
            .iter()
            .filter(|(_, counts)| !counts.is_read_only())
            .map(|(p, _)| p.clone())
            .collect();
        let record = CommitRecord {
            transaction: info.id,
            sequence,
            writers,
        };
        if let Err(error) = self.log.record_commit(record).await {
            let cause = AbortCause::Storage {
                participant: "log".into(),
                error,
            };
            return Err(self.abort(info, cause).await);
        }

        for participant in info.participants.keys() {
            let request = ResourceRequest {
                participant: participant.clone(),
                transaction: info.id,
                action: ResourceAction::Confirm { sequence },
            };
            if let Err(e) = self.send(request).await {
                tracing::warn!(silo = %self.local, transaction = %info.id, participant = %participant, error = %e, "confirm failed, participant recovers on load");
            }
        }

        tracing::info!(
            silo = %self.local,
            transaction = %info.id,
            sequence,
            participants = info.participants.len(),
            "transaction committed"
        );
        Ok(())
    }

    async fn prepare(
        &self,
        transaction: TransactionId,
        participant: &ParticipantId,
        sequence: u64,
    ) -> Result<(), AbortCause> {
        let attempts = self.options.max_prepare_attempts.max(1);
        let mut last_error = StorageError::Failed("no attempt made".into());
        for attempt in 0..attempts {
            let request = ResourceRequest {
                participant: participant.clone(),
                transaction,
                action: ResourceAction::Prepare { sequence },
            };
            match self.send(request).await {
                Ok(()) => return Ok(()),
                Err(PrepareFailure::Transaction(TransactionError::Storage(error))) => {
                    tracing::debug!(silo = %self.local, transaction = %transaction, participant = %participant, attempt, error = %error, "prepare storage failure, retrying");
                    last_error = error;
                    self.time.sleep(self.options.prepare_backoff).await;
                }
                Err(PrepareFailure::Transaction(TransactionError::InconsistentState {
                    participant,
                    reason,
                })) => return Err(AbortCause::Conflict { participant, reason }),
                Err(PrepareFailure::Transaction(TransactionError::Aborted { cause, .. })) => {
                    return Err(cause)
                }
                Err(PrepareFailure::Transaction(_)) | Err(PrepareFailure::Transport(_)) => {
                    return Err(AbortCause::Unavailable {
                        participant: participant.to_string(),
                    })
                }
            }
        }
        Err(AbortCause::Storage {
            participant: participant.to_string(),
            error: last_error,
        })
    }

    /// Abort `info` on every participant. Returns the error to surface.
    pub async fn abort(&self, info: &TransactionInfo, cause: AbortCause) -> TransactionError {
        for participant in info.participants.keys() {
            let request = ResourceRequest {
                participant: participant.clone(),
                transaction: info.id,
                action: ResourceAction::Abort,
            };
            if let Err(e) = self.send(request).await {
                tracing::warn!(silo = %self.local, transaction = %info.id, participant = %participant, error = %e, "abort not delivered");
            }
        }
        tracing::info!(silo = %self.local, transaction = %info.id, cause = %cause, "transaction aborted");
        TransactionError::Aborted {
            transaction: info.id,
            cause,
        }
    }

    async fn send(&self, request: ResourceRequest) -> Result<(), PrepareFailure> {
        if request.participant.silo == self.local {
            return self
                .resources
                .handle(request)
                .await
                .map_err(PrepareFailure::Transaction);
        }
        let to = request.participant.silo.clone();
        let reply = self
            .transport
            .send(
                &self.local,
                &to,
                SiloMessage::Resource(request),
                self.options.participant_timeout,
            )
            .await
            .map_err(PrepareFailure::Transport)?;
        match reply {
            SiloReply::Resource(result) => result.map_err(PrepareFailure::Transaction),
            _ => Err(PrepareFailure::Transport(TransportError::UnexpectedReply { silo: to })),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum PrepareFailure {
    #[error(transparent)]
    Transaction(TransactionError),
    #[error(transparent)]
    Transport(TransportError),
}
