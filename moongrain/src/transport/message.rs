//! Inter-silo message envelope.

use serde::{Deserialize, Serialize};

use crate::directory::{DirectoryRequest, DirectoryResponse};
use crate::runtime::{DetailedGrainStatistic, InvokeRequest, InvokeResponse};
use crate::transactions::{ResourceRequest, TransactionError};
use crate::types::{GrainAddress, GrainId, GrainType};

/// Request sent from one silo to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SiloMessage {
    /// Failure-detector probe.
    Ping {
        /// Probe sequence number of the sender.
        probe: u64,
    },
    /// Grain directory operation, routed to the partition owner.
    Directory(DirectoryRequest),
    /// Grain method invocation.
    Invoke(InvokeRequest),
    /// Transaction participant operation (prepare, confirm, abort).
    Resource(ResourceRequest),
    /// A reminder row changed; the owning silo should reload it.
    ReminderChanged {
        /// Grain the reminder belongs to.
        grain: GrainId,
        /// Reminder name.
        name: String,
    },
    /// The directory kept another activation; the named one must go.
    DuplicateActivation(GrainAddress),
    /// Management query for local activations.
    GrainStatistics {
        /// Restrict to these grain types.
        types: Option<Vec<GrainType>>,
    },
}

impl SiloMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SiloMessage::Ping { .. } => "ping",
            SiloMessage::Directory(_) => "directory",
            SiloMessage::Invoke(_) => "invoke",
            SiloMessage::Resource(_) => "resource",
            SiloMessage::ReminderChanged { .. } => "reminder_changed",
            SiloMessage::DuplicateActivation(_) => "duplicate_activation",
            SiloMessage::GrainStatistics { .. } => "grain_statistics",
        }
    }
}

/// Reply to a [`SiloMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SiloReply {
    /// Answer to [`SiloMessage::Ping`].
    Pong,
    /// Answer to [`SiloMessage::Directory`].
    Directory(DirectoryResponse),
    /// Answer to [`SiloMessage::Invoke`].
    Invoke(InvokeResponse),
    /// Answer to [`SiloMessage::Resource`].
    Resource(Result<(), TransactionError>),
    /// Answer to [`SiloMessage::GrainStatistics`].
    GrainStatistics(Vec<DetailedGrainStatistic>),
    /// Generic acknowledgement.
    Ack,
    /// The silo is not serving requests (stopping or dead).
    Rejected,
}
