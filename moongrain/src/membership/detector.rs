//! Failure detector: probes ring successors, votes on missed probes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::oracle::MembershipOracle;
use crate::time::TimeProvider;
use crate::transport::{SiloMessage, SiloReply, SiloTransport};
use crate::types::SiloAddress;

/// Periodic prober for one silo.
///
/// Each round pings the `num_probed_silos` ring successors of the local
/// silo. Probing only successors keeps the total probe load linear in the
/// cluster size while every Active silo is still watched by several peers.
/// A timed-out probe increments the target's missed-probe counter; once it
/// reaches `missed_probes_limit` every further miss casts one suspicion vote
/// through [`MembershipOracle::try_suspect_or_kill`]. An answered probe
/// resets the counter.
pub struct FailureDetector {
    oracle: Rc<MembershipOracle>,
    transport: Rc<dyn SiloTransport>,
    time: Rc<dyn TimeProvider>,
    missed: RefCell<HashMap<SiloAddress, u32>>,
    probe_number: Cell<u64>,
}

impl FailureDetector {
    /// Create a detector for the oracle's local silo.
    pub fn new(
        oracle: Rc<MembershipOracle>,
        transport: Rc<dyn SiloTransport>,
        time: Rc<dyn TimeProvider>,
    ) -> Self {
        Self {
            oracle,
            transport,
            time,
            missed: RefCell::new(HashMap::new()),
            probe_number: Cell::new(0),
        }
    }

    /// Missed probes currently recorded against `silo`.
    pub fn missed_probes(&self, silo: &SiloAddress) -> u32 {
        self.missed.borrow().get(silo).copied().unwrap_or(0)
    }

    /// Probe every current target once. Returns the silos voted against.
    pub async fn probe_round(&self) -> Vec<SiloAddress> {
        let targets = self.oracle.probe_targets();
        self.missed.borrow_mut().retain(|silo, _| targets.contains(silo));

        let mut suspected = Vec::new();
        for target in targets {
            if self.probe(&target).await {
                self.missed.borrow_mut().remove(&target);
                continue;
            }

            let missed = {
                let mut missed = self.missed.borrow_mut();
                let count = missed.entry(target.clone()).or_insert(0);
                *count += 1;
                *count
            };
            tracing::debug!(silo = %self.oracle.local(), target = %target, missed, "probe missed");

            if missed >= self.oracle.options().missed_probes_limit {
                match self.oracle.try_suspect_or_kill(&target).await {
                    Ok(_) => suspected.push(target),
                    Err(e) => {
                        tracing::warn!(silo = %self.oracle.local(), target = %target, error = %e, "suspicion vote failed");
                    }
                }
            }
        }
        suspected
    }

    async fn probe(&self, target: &SiloAddress) -> bool {
        let probe = self.probe_number.get() + 1;
        self.probe_number.set(probe);
        let reply = self
            .transport
            .send(
                self.oracle.local(),
                target,
                SiloMessage::Ping { probe },
                self.oracle.options().probe_timeout,
            )
            .await;
        matches!(reply, Ok(SiloReply::Pong) | Ok(SiloReply::Rejected))
    }

    /// Probe rounds until the oracle terminates.
    pub async fn run(self: Rc<Self>) {
        loop {
            self.time.sleep(self.oracle.options().probe_interval).await;
            if self.oracle.is_terminated() {
                break;
            }
            if !self.oracle.status().is_active() {
                continue;
            }
            self.probe_round().await;
        }
    }
}
