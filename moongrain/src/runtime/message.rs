//! Grain invocation envelope.

use serde::{Deserialize, Serialize};

use super::GrainCancellationToken;
use crate::error::GrainError;
use crate::reminders::TickStatus;
use crate::transactions::TransactionInfo;
use crate::types::{ActivationId, GrainAddress, GrainId, GrainType, SiloAddress};

/// What the activation is asked to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InvokeKind {
    /// A grain method.
    Method {
        /// Method name.
        name: String,
        /// Encoded request body.
        body: Vec<u8>,
    },
    /// A reminder tick.
    Reminder {
        /// Reminder name.
        name: String,
        /// Tick details.
        status: TickStatus,
    },
}

impl InvokeKind {
    /// Method or reminder name, for logs.
    pub fn name(&self) -> &str {
        match self {
            InvokeKind::Method { name, .. } | InvokeKind::Reminder { name, .. } => name,
        }
    }
}

/// A grain call travelling to the silo that hosts (or will host) the grain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Target grain.
    pub target: GrainId,
    /// Expected activation, when the caller resolved one. `None` lets the
    /// receiving silo activate the grain.
    pub target_activation: Option<ActivationId>,
    /// Calling silo.
    pub caller: SiloAddress,
    /// Method or reminder tick.
    pub kind: InvokeKind,
    /// Forked transaction record when the call joins one.
    pub transaction: Option<TransactionInfo>,
    /// The callee starts and resolves a new transaction.
    pub create_transaction: bool,
    /// Run even if the target is busy with a non-reentrant turn.
    pub always_interleave: bool,
    /// Times this request was forwarded between silos.
    pub forward_count: u32,
    /// Cancellation, only meaningful inside one process.
    #[serde(skip)]
    pub cancellation: Option<GrainCancellationToken>,
}

/// Hint that the caller's cached location of a grain is wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    /// The grain.
    pub grain: GrainId,
    /// Activation the caller targeted, now gone.
    pub stale: Option<ActivationId>,
    /// Where the grain actually lives, if known.
    pub valid: Option<GrainAddress>,
}

/// Reply to an [`InvokeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    /// Encoded response body, or the failure.
    pub result: Result<Vec<u8>, GrainError>,
    /// The callee's view of a joined transaction.
    pub transaction: Option<TransactionInfo>,
    /// Piggybacked directory cache correction.
    pub invalidation: Option<CacheInvalidation>,
}

impl InvokeResponse {
    /// Response carrying only `error`.
    pub fn error(error: GrainError) -> Self {
        Self {
            result: Err(error),
            transaction: None,
            invalidation: None,
        }
    }

    /// Attach a cache correction.
    pub fn with_invalidation(mut self, invalidation: CacheInvalidation) -> Self {
        self.invalidation = Some(invalidation);
        self
    }
}

/// One activation, as reported by management queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailedGrainStatistic {
    /// Registered name of the grain type.
    pub grain_type_name: String,
    /// Grain type tag.
    pub grain_type: GrainType,
    /// The grain.
    pub grain: GrainId,
    /// Hosting silo.
    pub silo: SiloAddress,
    /// The activation.
    pub activation_id: ActivationId,
}
