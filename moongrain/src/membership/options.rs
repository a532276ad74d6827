//! Membership and failure-detection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many distinct suspicion votes declare a silo dead.
///
/// `Absolute(n)` always needs `n` votes. `CappedByActive(n)` needs
/// `min(n, (active + 1) / 2)` where `active` counts Active silos whose
/// heartbeat is fresh, so a two- or three-silo cluster can still evict a
/// dead member. Either way at least one vote is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumPolicy {
    /// Fixed vote count.
    Absolute(usize),
    /// Vote count capped by half the fresh Active silos (rounded up).
    CappedByActive(usize),
}

impl QuorumPolicy {
    /// Votes required given `active_non_stale` fresh Active silos.
    pub fn required_votes(self, active_non_stale: usize) -> usize {
        let required = match self {
            QuorumPolicy::Absolute(n) => n,
            QuorumPolicy::CappedByActive(n) => n.min(active_non_stale.div_ceil(2)),
        };
        required.max(1)
    }
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Absolute(2)
    }
}

/// Configuration for the membership oracle and failure detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipOptions {
    /// Interval between probe rounds.
    pub probe_interval: Duration,
    /// How long a probe may go unanswered.
    pub probe_timeout: Duration,
    /// Number of ring successors each silo probes.
    pub num_probed_silos: usize,
    /// Consecutive missed probes before casting a suspicion vote.
    pub missed_probes_limit: u32,
    /// Votes needed to declare a silo dead.
    pub quorum: QuorumPolicy,
    /// Votes older than this are ignored.
    pub death_vote_expiration: Duration,
    /// Interval between "I am alive" heartbeats.
    pub i_am_alive_interval: Duration,
    /// Active silos whose heartbeat is older than this are not counted as
    /// voters for [`QuorumPolicy::CappedByActive`].
    pub i_am_alive_staleness: Duration,
    /// Interval between unconditional table reads.
    pub table_refresh_interval: Duration,
    /// Retry budget for one table write.
    pub max_update_attempts: u32,
    /// First retry backoff; doubles on each attempt.
    pub update_backoff: Duration,
    /// Ring points per silo.
    pub ring_points_per_silo: usize,
}

impl Default for MembershipOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            num_probed_silos: 3,
            missed_probes_limit: 1,
            quorum: QuorumPolicy::default(),
            death_vote_expiration: Duration::from_secs(120),
            i_am_alive_interval: Duration::from_secs(30),
            i_am_alive_staleness: Duration::from_secs(120),
            table_refresh_interval: Duration::from_secs(60),
            max_update_attempts: 8,
            update_backoff: Duration::from_millis(50),
            ring_points_per_silo: 1,
        }
    }
}

impl MembershipOptions {
    /// Short intervals for tests running on a paused clock.
    pub fn for_simulation() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            num_probed_silos: 3,
            missed_probes_limit: 1,
            quorum: QuorumPolicy::default(),
            death_vote_expiration: Duration::from_secs(20),
            i_am_alive_interval: Duration::from_secs(2),
            i_am_alive_staleness: Duration::from_secs(10),
            table_refresh_interval: Duration::from_secs(1),
            max_update_attempts: 8,
            update_backoff: Duration::from_millis(10),
            ring_points_per_silo: 1,
        }
    }
}
