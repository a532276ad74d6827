//! Partitioned directory spread over the Active silos.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{DirectoryError, DirectoryOptions, DirectoryPartition, GrainDirectory};
use crate::membership::{MembershipOracle, MembershipSnapshot};
use crate::ring::{ConsistentRing, RingRange};
use crate::time::TimeProvider;
use crate::transport::{SiloMessage, SiloReply, SiloTransport};
use crate::types::{GrainAddress, GrainId, SiloAddress};

/// Directory request sent to a partition owner (or, for handoff, to a peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectoryRequest {
    /// Register an activation.
    Register {
        /// Proposed record.
        address: GrainAddress,
    },
    /// Look up a grain.
    Lookup {
        /// The grain.
        grain: GrainId,
    },
    /// Remove a record if the activation matches.
    Unregister {
        /// Record to remove.
        address: GrainAddress,
    },
    /// Purge records hosted on dead silos.
    UnregisterSilos {
        /// The dead silos.
        silos: Vec<SiloAddress>,
    },
    /// Copy every record in these arcs to the requester.
    TransferRange {
        /// Arcs newly owned by the requester.
        ranges: Vec<RingRange>,
    },
    /// The requester merged these transferred records; drop the local
    /// copies of the ones this silo no longer owns.
    ReleaseRange {
        /// Records the requester now holds.
        records: Vec<GrainAddress>,
    },
    /// Take ownership of these records.
    AcceptHandoff {
        /// Records pushed by their previous owner.
        records: Vec<GrainAddress>,
    },
}

impl DirectoryRequest {
    fn grain(&self) -> Option<&GrainId> {
        match self {
            DirectoryRequest::Register { address } | DirectoryRequest::Unregister { address } => {
                Some(&address.grain_id)
            }
            DirectoryRequest::Lookup { grain } => Some(grain),
            _ => None,
        }
    }
}

/// Answer to a [`DirectoryRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectoryResponse {
    /// The winning record of a registration.
    Registered(GrainAddress),
    /// Lookup result.
    Found(Option<GrainAddress>),
    /// Records handed over by [`DirectoryRequest::TransferRange`].
    Records(Vec<GrainAddress>),
    /// The receiver does not own the grain's partition in its view.
    NotOwner,
    /// Done.
    Done,
}

/// Directory partitioned over the Active silos by consistent hashing.
///
/// # Rebalancing
///
/// On every membership view change each silo:
///
/// 1. purges records hosted on silos that left the view;
/// 2. pushes records it no longer owns to their new owners;
/// 3. pulls the records of its newly owned arcs from their previous owners
///    (still-active ones only). The previous owner keeps its copies until
///    the puller confirms the merge with a release, so a lost transfer reply
///    loses nothing.
///
/// A dead owner's partition is simply gone. Survivors re-register their own
/// activations whose directory owner died (the catalog does this), and any
/// grain nobody re-registers is re-activated on its next call.
///
/// When two different activations of one grain meet during a merge, the
/// lower activation id is kept and the loser's silo is told to deactivate it.
pub struct DistributedGrainDirectory {
    local: SiloAddress,
    oracle: Rc<MembershipOracle>,
    transport: Rc<dyn SiloTransport>,
    time: Rc<dyn TimeProvider>,
    options: DirectoryOptions,
    partition: DirectoryPartition,
    view: RefCell<Rc<MembershipSnapshot>>,
}

impl fmt::Debug for DistributedGrainDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedGrainDirectory")
            .field("local", &self.local)
            .field("records", &self.partition.len())
            .field("view", &self.view.borrow().version)
            .finish()
    }
}

impl DistributedGrainDirectory {
    /// Create the directory for the oracle's local silo.
    pub fn new(
        oracle: Rc<MembershipOracle>,
        transport: Rc<dyn SiloTransport>,
        time: Rc<dyn TimeProvider>,
        options: DirectoryOptions,
    ) -> Self {
        Self {
            local: oracle.local().clone(),
            oracle,
            transport,
            time,
            options,
            partition: DirectoryPartition::new(),
            view: RefCell::new(Rc::new(MembershipSnapshot::default())),
        }
    }

    /// The local partition.
    pub fn partition(&self) -> &DirectoryPartition {
        &self.partition
    }

    fn owner(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.oracle.current().ring().owner_of(grain).cloned()
    }

    fn owns(&self, grain: &GrainId) -> bool {
        self.owner(grain).as_ref() == Some(&self.local)
    }

    /// Send `request` to the owner of `grain`, re-routing on `NotOwner` or
    /// an unreachable owner.
    async fn route(
        &self,
        grain: &GrainId,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, DirectoryError> {
        let attempts = self.options.max_hops + 1;
        for attempt in 0..attempts {
            let Some(owner) = self.owner(grain) else {
                return Err(DirectoryError::NoOwner {
                    grain: grain.clone(),
                });
            };
            if owner == self.local {
                return Ok(self.handle_owned(request));
            }

            let reply = self
                .transport
                .send(
                    &self.local,
                    &owner,
                    SiloMessage::Directory(request.clone()),
                    self.options.request_timeout,
                )
                .await;
            match reply {
                Ok(SiloReply::Directory(DirectoryResponse::NotOwner)) => {
                    tracing::debug!(silo = %self.local, grain = %grain, owner = %owner, attempt, "not owner, re-routing");
                }
                Ok(SiloReply::Directory(response)) => return Ok(response),
                Ok(SiloReply::Rejected) => {
                    tracing::debug!(silo = %self.local, grain = %grain, owner = %owner, attempt, "owner rejected request");
                }
                Ok(_) => return Err(DirectoryError::UnexpectedResponse { silo: owner }),
                Err(e) => {
                    tracing::warn!(silo = %self.local, grain = %grain, owner = %owner, error = %e, attempt, "directory owner unreachable");
                }
            }

            if let Err(e) = self.oracle.refresh().await {
                tracing::warn!(silo = %self.local, error = %e, "membership refresh failed");
            }
            self.time.sleep(self.options.retry_backoff).await;
        }
        Err(DirectoryError::Unavailable {
            grain: grain.clone(),
            attempts,
        })
    }

    fn handle_owned(&self, request: DirectoryRequest) -> DirectoryResponse {
        match request {
            DirectoryRequest::Register { address } => {
                let view = self.oracle.current();
                let winner = self.partition.register(address, |silo| view.is_active(silo));
                DirectoryResponse::Registered(winner)
            }
            DirectoryRequest::Lookup { grain } => {
                DirectoryResponse::Found(self.partition.lookup(&grain))
            }
            DirectoryRequest::Unregister { address } => {
                self.partition.unregister(&address);
                DirectoryResponse::Done
            }
            _ => DirectoryResponse::Done,
        }
    }

    /// Serve a request from another silo.
    pub async fn handle(&self, from: &SiloAddress, request: DirectoryRequest) -> DirectoryResponse {
        match request {
            DirectoryRequest::UnregisterSilos { silos } => {
                self.partition.unregister_silos(&silos);
                DirectoryResponse::Done
            }
            DirectoryRequest::TransferRange { ranges } => {
                let records = self
                    .partition
                    .matching(|grain| ranges.iter().any(|r| r.contains(grain.uniform_hash())));
                tracing::debug!(silo = %self.local, to = %from, records = records.len(), "transferring directory range");
                DirectoryResponse::Records(records)
            }
            DirectoryRequest::ReleaseRange { records } => {
                let released = records
                    .iter()
                    .filter(|record| {
                        !self.owns(&record.grain_id) && self.partition.unregister(record)
                    })
                    .count();
                tracing::debug!(silo = %self.local, to = %from, released, "released transferred records");
                DirectoryResponse::Done
            }
            DirectoryRequest::AcceptHandoff { records } => {
                tracing::debug!(silo = %self.local, from = %from, records = records.len(), "accepting directory handoff");
                self.accept(records).await;
                DirectoryResponse::Done
            }
            request => match request.grain() {
                Some(grain) if self.owns(grain) => self.handle_owned(request),
                _ => DirectoryResponse::NotOwner,
            },
        }
    }

    async fn accept(&self, records: Vec<GrainAddress>) {
        for loser in self.partition.merge(records) {
            tracing::info!(silo = %self.local, loser = %loser, "duplicate activation found during handoff");
            let reply = self
                .transport
                .send(
                    &self.local,
                    &loser.silo,
                    SiloMessage::DuplicateActivation(loser.clone()),
                    self.options.request_timeout,
                )
                .await;
            if let Err(e) = reply {
                tracing::warn!(silo = %self.local, loser = %loser, error = %e, "could not notify duplicate activation");
            }
        }
    }

    /// Rebalance after a membership view change.
    pub async fn on_view_change(&self, new: Rc<MembershipSnapshot>) {
        let old = self.view.replace(new.clone());
        if new.version <= old.version {
            return;
        }

        let removed = new.removed_since(&old);
        if !removed.is_empty() {
            let purged = self.partition.unregister_silos(&removed);
            tracing::info!(silo = %self.local, version = %new.version, removed = ?removed, purged = purged.len(), "purged records of departed silos");
        }
        if !new.is_active(&self.local) {
            return;
        }

        let local = self.local.clone();
        let moved = self
            .partition
            .take_matching(|grain| new.ring().owner_of(grain) != Some(&local));
        if !moved.is_empty() {
            self.push_records(moved, new.ring()).await;
        }

        let owned = new.ring().ranges_of(&self.local);
        let without_local = ConsistentRing::from_silos(
            new.active_silos().iter().filter(|s| **s != self.local),
            self.oracle.options().ring_points_per_silo,
        );
        let mut previous_owners: BTreeSet<SiloAddress> = BTreeSet::new();
        for range in &owned {
            for ring in [old.ring(), &without_local] {
                for owner in ring.owners_of_range(range) {
                    if owner != self.local && new.is_active(&owner) {
                        previous_owners.insert(owner);
                    }
                }
            }
        }

        for owner in previous_owners {
            let reply = self
                .transport
                .send(
                    &self.local,
                    &owner,
                    SiloMessage::Directory(DirectoryRequest::TransferRange {
                        ranges: owned.clone(),
                    }),
                    self.options.handoff_timeout,
                )
                .await;
            match reply {
                Ok(SiloReply::Directory(DirectoryResponse::Records(records))) => {
                    if records.is_empty() {
                        continue;
                    }
                    tracing::info!(silo = %self.local, from = %owner, records = records.len(), "pulled directory range");
                    self.accept(records.clone()).await;
                    self.release(&owner, records).await;
                }
                Ok(_) => {
                    tracing::warn!(silo = %self.local, from = %owner, "unexpected reply to range transfer");
                }
                Err(e) => {
                    tracing::warn!(silo = %self.local, from = %owner, error = %e, "range transfer failed");
                }
            }
        }
    }

    /// Tell `owner` the pulled `records` are merged here.
    async fn release(&self, owner: &SiloAddress, records: Vec<GrainAddress>) {
        let reply = self
            .transport
            .send(
                &self.local,
                owner,
                SiloMessage::Directory(DirectoryRequest::ReleaseRange { records }),
                self.options.handoff_timeout,
            )
            .await;
        if let Err(e) = reply {
            // The copies stay on `owner` until its own rebalance pushes them.
            tracing::warn!(silo = %self.local, to = %owner, error = %e, "range release failed");
        }
    }

    /// Push the whole partition to the remaining silos before leaving.
    pub async fn hand_off_all(&self) {
        let view = self.oracle.current();
        let survivors = ConsistentRing::from_silos(
            view.active_silos().iter().filter(|s| **s != self.local),
            self.oracle.options().ring_points_per_silo,
        );
        let records = self.partition.take_matching(|_| true);
        if records.is_empty() || survivors.is_empty() {
            return;
        }
        tracing::info!(silo = %self.local, records = records.len(), "handing off directory partition");
        self.push_records(records, &survivors).await;
    }

    async fn push_records(&self, records: Vec<GrainAddress>, ring: &ConsistentRing) {
        let mut by_owner: BTreeMap<SiloAddress, Vec<GrainAddress>> = BTreeMap::new();
        let mut orphans = Vec::new();
        for record in records {
            match ring.owner_of(&record.grain_id) {
                Some(owner) => by_owner.entry(owner.clone()).or_default().push(record),
                None => orphans.push(record),
            }
        }

        for (owner, records) in by_owner {
            let count = records.len();
            let reply = self
                .transport
                .send(
                    &self.local,
                    &owner,
                    SiloMessage::Directory(DirectoryRequest::AcceptHandoff {
                        records: records.clone(),
                    }),
                    self.options.handoff_timeout,
                )
                .await;
            match reply {
                Ok(SiloReply::Directory(DirectoryResponse::Done)) => {
                    tracing::debug!(silo = %self.local, to = %owner, records = count, "pushed directory records");
                }
                _ => {
                    tracing::warn!(silo = %self.local, to = %owner, records = count, "directory push failed, keeping records");
                    orphans.extend(records);
                }
            }
        }

        if !orphans.is_empty() {
            self.partition.merge(orphans);
        }
    }
}

#[async_trait::async_trait(?Send)]
impl GrainDirectory for DistributedGrainDirectory {
    async fn register(&self, address: GrainAddress) -> Result<GrainAddress, DirectoryError> {
        let grain = address.grain_id.clone();
        match self
            .route(&grain, DirectoryRequest::Register { address })
            .await?
        {
            DirectoryResponse::Registered(winner) => Ok(winner),
            _ => Err(DirectoryError::UnexpectedResponse {
                silo: self.local.clone(),
            }),
        }
    }

    async fn lookup(&self, grain: &GrainId) -> Result<Option<GrainAddress>, DirectoryError> {
        match self
            .route(grain, DirectoryRequest::Lookup {
                grain: grain.clone(),
            })
            .await?
        {
            DirectoryResponse::Found(found) => Ok(found),
            _ => Err(DirectoryError::UnexpectedResponse {
                silo: self.local.clone(),
            }),
        }
    }

    async fn unregister(&self, address: &GrainAddress) -> Result<(), DirectoryError> {
        self.route(
            &address.grain_id,
            DirectoryRequest::Unregister {
                address: address.clone(),
            },
        )
        .await?;
        Ok(())
    }

    async fn unregister_silos(&self, silos: &[SiloAddress]) -> Result<(), DirectoryError> {
        self.partition.unregister_silos(silos);
        for peer in self.oracle.current().active_silos() {
            if peer == self.local {
                continue;
            }
            let reply = self
                .transport
                .send(
                    &self.local,
                    &peer,
                    SiloMessage::Directory(DirectoryRequest::UnregisterSilos {
                        silos: silos.to_vec(),
                    }),
                    self.options.request_timeout,
                )
                .await;
            if let Err(e) = reply {
                tracing::warn!(silo = %self.local, peer = %peer, error = %e, "unregister_silos broadcast failed");
            }
        }
        Ok(())
    }
}
