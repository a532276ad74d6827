//! Transaction identity and the per-call transaction record.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::AbortCause;
use crate::types::{GrainId, SiloAddress};

/// Unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{:016x}", self.0)
    }
}

/// One transactional state of one grain activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId {
    /// Owning grain.
    pub grain: GrainId,
    /// State name within the grain.
    pub name: String,
    /// Silo hosting the activation.
    pub silo: SiloAddress,
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.grain, self.name, self.silo)
    }
}

/// Reads and writes a transaction made on one participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCounts {
    /// Number of reads.
    pub reads: u32,
    /// Number of writes.
    pub writes: u32,
}

impl AccessCounts {
    /// Whether the participant only read.
    pub fn is_read_only(&self) -> bool {
        self.writes == 0
    }
}

/// The transaction record carried by every call inside a transaction.
///
/// A caller [`fork`](Self::fork)s it into each request and
/// [`join`](Self::join)s the copy returned with the response, so the root
/// ends up knowing every participant and any abort cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: TransactionId,
    /// Start time on the root silo's clock.
    pub start_time: Duration,
    /// Participants touched so far.
    pub participants: BTreeMap<ParticipantId, AccessCounts>,
    /// First recorded reason to abort.
    pub abort_cause: Option<AbortCause>,
}

/// Mutable, shared handle to the transaction record of the current call.
pub type TransactionContext = Rc<RefCell<TransactionInfo>>;

impl TransactionInfo {
    /// Fresh record with no participants.
    pub fn new(id: TransactionId, start_time: Duration) -> Self {
        Self {
            id,
            start_time,
            participants: BTreeMap::new(),
            abort_cause: None,
        }
    }

    /// Copy to send with a call. Participants are not copied; the callee
    /// reports only what it adds.
    pub fn fork(&self) -> Self {
        Self::new(self.id, self.start_time)
    }

    /// Merge what a callee reported.
    pub fn join(&mut self, other: &TransactionInfo) {
        for (participant, counts) in &other.participants {
            let entry = self.participants.entry(participant.clone()).or_default();
            entry.reads += counts.reads;
            entry.writes += counts.writes;
        }
        if self.abort_cause.is_none() {
            self.abort_cause = other.abort_cause.clone();
        }
    }

    /// Count a read of `participant`.
    pub fn record_read(&mut self, participant: &ParticipantId) {
        self.participants
            .entry(participant.clone())
            .or_default()
            .reads += 1;
    }

    /// Count a write of `participant`.
    pub fn record_write(&mut self, participant: &ParticipantId) {
        self.participants
            .entry(participant.clone())
            .or_default()
            .writes += 1;
    }

    /// Doom the transaction. The first cause is kept.
    pub fn record_abort(&mut self, cause: AbortCause) {
        if self.abort_cause.is_none() {
            self.abort_cause = Some(cause);
        }
    }
}
