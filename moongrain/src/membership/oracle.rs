//! Membership oracle: one silo's view of the cluster and its writes to the
//! membership table.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::watch;

use super::options::MembershipOptions;
use super::snapshot::MembershipSnapshot;
use super::table::{
    MembershipEntry, MembershipTable, MembershipTableData, MembershipVersion, SiloStatus,
    SuspectVote,
};
use super::MembershipError;
use crate::time::TimeProvider;
use crate::types::SiloAddress;

/// A single table write computed from a fresh read.
enum RowWrite {
    Insert(MembershipEntry),
    Update(MembershipEntry),
}

/// Process-scoped membership view and table writer for one silo.
///
/// Lifecycle: [`join`](Self::join) inserts a `Joining` row and promotes it
/// to `Active`; the heartbeat and refresh loops keep the row and the view
/// current; [`leave`](Self::leave) walks the row to `Dead`. If a refresh
/// finds the local row `Dead` (the cluster evicted this silo), the oracle
/// marks itself terminated and never writes again.
pub struct MembershipOracle {
    local: SiloAddress,
    name: String,
    table: Rc<dyn MembershipTable>,
    time: Rc<dyn TimeProvider>,
    options: MembershipOptions,
    view: watch::Sender<Rc<MembershipSnapshot>>,
    status: Cell<SiloStatus>,
}

impl MembershipOracle {
    /// Create an oracle for `local`. Nothing is written until [`join`](Self::join).
    pub fn new(
        local: SiloAddress,
        name: impl Into<String>,
        table: Rc<dyn MembershipTable>,
        time: Rc<dyn TimeProvider>,
        options: MembershipOptions,
    ) -> Self {
        let (view, _) = watch::channel(Rc::new(MembershipSnapshot::default()));
        Self {
            local,
            name: name.into(),
            table,
            time,
            options,
            view,
            status: Cell::new(SiloStatus::Joining),
        }
    }

    /// The local silo.
    pub fn local(&self) -> &SiloAddress {
        &self.local
    }

    /// The local silo's last written status.
    pub fn status(&self) -> SiloStatus {
        self.status.get()
    }

    /// Whether the cluster declared this silo dead (or it left).
    pub fn is_terminated(&self) -> bool {
        self.status.get() == SiloStatus::Dead
    }

    /// Settings in use.
    pub fn options(&self) -> &MembershipOptions {
        &self.options
    }

    /// The latest published view.
    pub fn current(&self) -> Rc<MembershipSnapshot> {
        self.view.borrow().clone()
    }

    /// Subscribe to view changes.
    pub fn subscribe(&self) -> watch::Receiver<Rc<MembershipSnapshot>> {
        self.view.subscribe()
    }

    /// Silos this silo probes: its ring successors among Active silos.
    pub fn probe_targets(&self) -> Vec<SiloAddress> {
        self.current()
            .ring()
            .successors(&self.local, self.options.num_probed_silos)
    }

    /// Insert the local row, retire older incarnations, and become Active.
    pub async fn join(&self) -> Result<(), MembershipError> {
        let local = self.local.clone();
        let name = self.name.clone();
        let now = self.time.timer();
        self.write_with_retry("join", |data| {
            if data.entry(&local).is_some() {
                return Err(MembershipError::AlreadyExists {
                    silo: local.clone(),
                });
            }
            Ok(Some(RowWrite::Insert(MembershipEntry::joining(
                local.clone(),
                name.clone(),
                now,
            ))))
        })
        .await?;
        tracing::info!(silo = %self.local, name = %self.name, "silo joining cluster");

        self.retire_previous_generations().await?;
        self.update_status(SiloStatus::Active).await?;
        Ok(())
    }

    async fn retire_previous_generations(&self) -> Result<(), MembershipError> {
        let data = self.table.read_all().await?;
        let stale: Vec<SiloAddress> = data
            .entries
            .iter()
            .filter(|e| {
                e.silo.same_endpoint(&self.local)
                    && e.silo.generation < self.local.generation
                    && !e.status.is_terminal()
            })
            .map(|e| e.silo.clone())
            .collect();

        for old in stale {
            self.write_with_retry("retire", |data| {
                let Some(entry) = data.entry(&old) else {
                    return Ok(None);
                };
                if entry.status.is_terminal() {
                    return Ok(None);
                }
                let mut updated = entry.clone();
                updated.status = SiloStatus::Dead;
                Ok(Some(RowWrite::Update(updated)))
            })
            .await?;
            tracing::info!(silo = %self.local, previous = %old, "retired previous incarnation");
        }
        Ok(())
    }

    /// Write a new status for the local silo.
    ///
    /// # Errors
    ///
    /// [`MembershipError::SiloDead`] if the row is already dead,
    /// [`MembershipError::UpdateFailed`] once the retry budget is spent.
    pub async fn update_status(&self, status: SiloStatus) -> Result<(), MembershipError> {
        let local = self.local.clone();
        let time = self.time.clone();
        self.write_with_retry("update_status", |data| {
            let Some(entry) = data.entry(&local) else {
                return Err(MembershipError::NotFound {
                    silo: local.clone(),
                });
            };
            if entry.status.is_terminal() {
                if status.is_terminal() {
                    return Ok(None);
                }
                return Err(MembershipError::SiloDead {
                    silo: local.clone(),
                });
            }
            let mut updated = entry.clone();
            updated.status = status;
            updated.i_am_alive_time = time.timer();
            Ok(Some(RowWrite::Update(updated)))
        })
        .await?;

        self.status.set(status);
        tracing::info!(silo = %self.local, status = %status, "silo status updated");
        self.refresh().await?;
        Ok(())
    }

    /// Refresh the local row's "I am alive" timestamp.
    pub async fn heartbeat(&self) -> Result<(), MembershipError> {
        let local = self.local.clone();
        let time = self.time.clone();
        self.write_with_retry("heartbeat", |data| {
            let Some(entry) = data.entry(&local) else {
                return Err(MembershipError::NotFound {
                    silo: local.clone(),
                });
            };
            if entry.status.is_terminal() {
                return Err(MembershipError::SiloDead {
                    silo: local.clone(),
                });
            }
            let mut updated = entry.clone();
            updated.i_am_alive_time = time.timer();
            Ok(Some(RowWrite::Update(updated)))
        })
        .await?;
        Ok(())
    }

    /// Record a suspicion vote against `target`, declaring it dead if the
    /// fresh distinct votes reach the quorum.
    ///
    /// Returns `true` if `target` is dead after the call. A silo never votes
    /// against itself, and only an Active silo votes.
    pub async fn try_suspect_or_kill(&self, target: &SiloAddress) -> Result<bool, MembershipError> {
        if target == &self.local || self.status.get() != SiloStatus::Active {
            return Ok(false);
        }

        let local = self.local.clone();
        let now = self.time.timer();
        let options = self.options.clone();
        let mut outcome = false;
        let mut votes_cast = 0usize;
        let mut votes_required = 0usize;

        self.write_with_retry("suspect", |data| {
            let Some(entry) = data.entry(target) else {
                outcome = false;
                return Ok(None);
            };
            if entry.status.is_terminal() {
                outcome = true;
                return Ok(None);
            }
            if !data.entry(&local).is_some_and(|e| e.status.is_active()) {
                outcome = false;
                return Ok(None);
            }

            let mut votes: Vec<SuspectVote> = Vec::new();
            for vote in entry.fresh_votes(now, options.death_vote_expiration) {
                if vote.suspecter != local && !votes.iter().any(|v| v.suspecter == vote.suspecter) {
                    votes.push(vote);
                }
            }
            votes.push(SuspectVote {
                suspecter: local.clone(),
                at: now,
            });

            let active_non_stale =
                active_non_stale(data, target, now, options.i_am_alive_staleness);
            let required = options.quorum.required_votes(active_non_stale);
            votes_cast = votes.len();
            votes_required = required;

            let mut updated = entry.clone();
            updated.suspect_votes = votes;
            outcome = votes_cast >= required;
            if outcome {
                updated.status = SiloStatus::Dead;
            }
            Ok(Some(RowWrite::Update(updated)))
        })
        .await?;

        if outcome {
            tracing::warn!(
                silo = %self.local,
                target = %target,
                votes = votes_cast,
                required = votes_required,
                "declared silo dead"
            );
            self.refresh().await?;
        } else {
            tracing::info!(
                silo = %self.local,
                target = %target,
                votes = votes_cast,
                required = votes_required,
                "suspected silo"
            );
        }
        Ok(outcome)
    }

    /// Read the table and publish the view if it is newer.
    ///
    /// If the local row is `Dead`, the oracle terminates: the status is set
    /// to `Dead` locally and nothing is written again.
    pub async fn refresh(&self) -> Result<Rc<MembershipSnapshot>, MembershipError> {
        let data = self.table.read_all().await?;
        let snapshot = MembershipSnapshot::from_table(data, self.options.ring_points_per_silo);

        let declared_dead = snapshot
            .status(&self.local)
            .is_some_and(SiloStatus::is_terminal);
        if declared_dead && !self.is_terminated() {
            tracing::error!(silo = %self.local, version = %snapshot.version, "silo declared dead by the cluster, terminating");
            self.status.set(SiloStatus::Dead);
        }

        let newer = snapshot.version > self.view.borrow().version;
        if newer {
            tracing::debug!(
                silo = %self.local,
                version = %snapshot.version,
                active = snapshot.active_silos().len(),
                "membership view updated"
            );
            self.view.send_replace(Rc::new(snapshot));
        }
        Ok(self.current())
    }

    /// Leave the cluster: `ShuttingDown` (graceful) or `Stopping`, then `Dead`.
    pub async fn leave(&self, graceful: bool) -> Result<(), MembershipError> {
        if self.is_terminated() {
            return Ok(());
        }
        let intermediate = if graceful {
            SiloStatus::ShuttingDown
        } else {
            SiloStatus::Stopping
        };
        self.update_status(intermediate).await?;
        self.update_status(SiloStatus::Dead).await
    }

    /// Heartbeat until terminated.
    pub async fn heartbeat_loop(self: Rc<Self>) {
        loop {
            self.time.sleep(self.options.i_am_alive_interval).await;
            if self.is_terminated() {
                break;
            }
            if let Err(e) = self.heartbeat().await {
                tracing::warn!(silo = %self.local, error = %e, "heartbeat failed");
            }
        }
    }

    /// Re-read the table until terminated.
    pub async fn refresh_loop(self: Rc<Self>) {
        loop {
            self.time.sleep(self.options.table_refresh_interval).await;
            if let Err(e) = self.refresh().await {
                tracing::warn!(silo = %self.local, error = %e, "membership refresh failed");
            }
            if self.is_terminated() {
                break;
            }
        }
    }

    /// Read, compute, write; retry on version conflicts with exponential
    /// backoff.
    async fn write_with_retry<F>(
        &self,
        operation: &'static str,
        mut build: F,
    ) -> Result<Option<MembershipVersion>, MembershipError>
    where
        F: FnMut(&MembershipTableData) -> Result<Option<RowWrite>, MembershipError>,
    {
        let attempts = self.options.max_update_attempts.max(1);
        for attempt in 0..attempts {
            let result = match self.table.read_all().await {
                Ok(data) => match build(&data)? {
                    None => return Ok(None),
                    Some(RowWrite::Insert(entry)) => {
                        self.table.insert_row(entry, data.version).await
                    }
                    Some(RowWrite::Update(entry)) => {
                        self.table.try_update_row(entry, data.version).await
                    }
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(version) => return Ok(Some(version)),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        silo = %self.local,
                        operation,
                        attempt,
                        error = %e,
                        "membership write retry"
                    );
                    self.time.sleep(backoff(self.options.update_backoff, attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(silo = %self.local, operation, attempts, "membership write gave up");
        Err(MembershipError::UpdateFailed {
            silo: self.local.clone(),
            attempts,
        })
    }
}

fn active_non_stale(
    data: &MembershipTableData,
    target: &SiloAddress,
    now: Duration,
    staleness: Duration,
) -> usize {
    data.entries
        .iter()
        .filter(|e| {
            &e.silo != target
                && e.status.is_active()
                && now.saturating_sub(e.i_am_alive_time) <= staleness
        })
        .count()
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(6))
}
