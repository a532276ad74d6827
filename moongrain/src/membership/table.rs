//! Membership table: the durable record of silo status.
//!
//! The table is a linearizable store of one row per silo incarnation plus a
//! single table-wide [`MembershipVersion`]. Every accepted write bumps the
//! version, and a write is accepted only if the writer observed the current
//! version. Readers therefore never see two writes applied against the same
//! version, and a writer that lost a race learns it from
//! [`MembershipError::VersionConflict`] and must re-read.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::MembershipError;
use crate::fault::FaultInjector;
use crate::types::SiloAddress;

/// Monotonically increasing membership table version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle status of a silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Row inserted, not yet serving.
    Joining,
    /// Serving requests; the only status counted in the Active view.
    Active,
    /// Graceful shutdown in progress.
    ShuttingDown,
    /// Ungraceful stop in progress.
    Stopping,
    /// Terminal. A dead incarnation never comes back.
    Dead,
}

impl SiloStatus {
    /// Whether the silo is in the Active view.
    pub fn is_active(self) -> bool {
        self == SiloStatus::Active
    }

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        self == SiloStatus::Dead
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// One suspicion vote: who suspected, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectVote {
    /// The voting silo.
    pub suspecter: SiloAddress,
    /// When the vote was cast, wall clock since the UNIX epoch.
    pub at: Duration,
}

/// Row of the membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// The silo incarnation this row describes.
    pub silo: SiloAddress,
    /// Human-readable silo name.
    pub name: String,
    /// Current status.
    pub status: SiloStatus,
    /// Suspicion votes, at most one per suspecter.
    pub suspect_votes: Vec<SuspectVote>,
    /// When the silo started, wall clock since the UNIX epoch.
    pub start_time: Duration,
    /// Last "I am alive" heartbeat written by the silo itself, wall clock
    /// since the UNIX epoch.
    pub i_am_alive_time: Duration,
}

impl MembershipEntry {
    /// Fresh `Joining` row.
    pub fn joining(silo: SiloAddress, name: impl Into<String>, now: Duration) -> Self {
        Self {
            silo,
            name: name.into(),
            status: SiloStatus::Joining,
            suspect_votes: Vec::new(),
            start_time: now,
            i_am_alive_time: now,
        }
    }

    /// Votes cast within `expiration` of `now`.
    pub fn fresh_votes(&self, now: Duration, expiration: Duration) -> Vec<SuspectVote> {
        self.suspect_votes
            .iter()
            .filter(|vote| now.saturating_sub(vote.at) <= expiration)
            .cloned()
            .collect()
    }
}

/// Result of [`MembershipTable::read_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTableData {
    /// All rows, dead ones included.
    pub entries: Vec<MembershipEntry>,
    /// Table version at read time.
    pub version: MembershipVersion,
}

impl MembershipTableData {
    /// Row for `silo`, if any.
    pub fn entry(&self, silo: &SiloAddress) -> Option<&MembershipEntry> {
        self.entries.iter().find(|e| &e.silo == silo)
    }
}

/// Pluggable durable membership store.
#[async_trait::async_trait(?Send)]
pub trait MembershipTable: fmt::Debug {
    /// Snapshot read of every row and the current version.
    async fn read_all(&self) -> Result<MembershipTableData, MembershipError>;

    /// Insert a new row. Fails if `version` is stale or the row exists.
    async fn insert_row(
        &self,
        entry: MembershipEntry,
        version: MembershipVersion,
    ) -> Result<MembershipVersion, MembershipError>;

    /// Replace an existing row. Fails if `version` is stale.
    async fn try_update_row(
        &self,
        entry: MembershipEntry,
        version: MembershipVersion,
    ) -> Result<MembershipVersion, MembershipError>;
}

/// In-memory membership table shared by all silos of a process.
#[derive(Debug, Default)]
pub struct InMemoryMembershipTable {
    state: RefCell<TableState>,
    faults: Option<Rc<FaultInjector>>,
}

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<SiloAddress, MembershipEntry>,
    version: MembershipVersion,
}

impl InMemoryMembershipTable {
    /// Create an empty table at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table whose writes consult `faults` at site `"membership.write"`.
    pub fn with_faults(faults: Rc<FaultInjector>) -> Self {
        Self {
            state: RefCell::default(),
            faults: Some(faults),
        }
    }

    /// Current version (for tests and diagnostics).
    pub fn version(&self) -> MembershipVersion {
        self.state.borrow().version
    }

    fn check_write(&self, version: MembershipVersion) -> Result<(), MembershipError> {
        if let Some(faults) = &self.faults {
            if faults.should_fail("membership.write") {
                return Err(MembershipError::Storage(
                    "injected fault at membership.write".to_string(),
                ));
            }
        }
        let actual = self.state.borrow().version;
        if actual != version {
            return Err(MembershipError::VersionConflict {
                expected: version,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl MembershipTable for InMemoryMembershipTable {
    async fn read_all(&self) -> Result<MembershipTableData, MembershipError> {
        let state = self.state.borrow();
        Ok(MembershipTableData {
            entries: state.rows.values().cloned().collect(),
            version: state.version,
        })
    }

    async fn insert_row(
        &self,
        entry: MembershipEntry,
        version: MembershipVersion,
    ) -> Result<MembershipVersion, MembershipError> {
        self.check_write(version)?;
        let mut state = self.state.borrow_mut();
        if state.rows.contains_key(&entry.silo) {
            return Err(MembershipError::AlreadyExists { silo: entry.silo });
        }
        state.version = state.version.next();
        state.rows.insert(entry.silo.clone(), entry);
        Ok(state.version)
    }

    async fn try_update_row(
        &self,
        entry: MembershipEntry,
        version: MembershipVersion,
    ) -> Result<MembershipVersion, MembershipError> {
        self.check_write(version)?;
        let mut state = self.state.borrow_mut();
        let Some(row) = state.rows.get_mut(&entry.silo) else {
            return Err(MembershipError::NotFound { silo: entry.silo });
        };
        if row.status.is_terminal() && !entry.status.is_terminal() {
            return Err(MembershipError::SiloDead { silo: entry.silo });
        }
        *row = entry;
        state.version = state.version.next();
        Ok(state.version)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, 1)
    }

    #[tokio::test]
    async fn test_insert_bumps_version() {
        let table = InMemoryMembershipTable::new();
        let v1 = table
            .insert_row(
                MembershipEntry::joining(silo(1), "a", Duration::ZERO),
                MembershipVersion(0),
            )
            .await
            .expect("insert should succeed");
        assert_eq!(v1, MembershipVersion(1));

        let data = table.read_all().await.expect("read should succeed");
        assert_eq!(data.version, MembershipVersion(1));
        assert_eq!(data.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let table = InMemoryMembershipTable::new();
        table
            .insert_row(
                MembershipEntry::joining(silo(1), "a", Duration::ZERO),
                MembershipVersion(0),
            )
            .await
            .expect("insert should succeed");

        let mut entry = MembershipEntry::joining(silo(1), "a", Duration::ZERO);
        entry.status = SiloStatus::Active;
        let result = table.try_update_row(entry, MembershipVersion(0)).await;

        assert_eq!(
            result,
            Err(MembershipError::VersionConflict {
                expected: MembershipVersion(0),
                actual: MembershipVersion(1),
            })
        );
        assert_eq!(table.version(), MembershipVersion(1));
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let table = InMemoryMembershipTable::new();
        let mut version = MembershipVersion(0);
        let mut seen = Vec::new();
        for port in 1..=3 {
            version = table
                .insert_row(MembershipEntry::joining(silo(port), "s", Duration::ZERO), version)
                .await
                .expect("insert should succeed");
            seen.push(version);
        }
        let mut entry = MembershipEntry::joining(silo(2), "s", Duration::ZERO);
        entry.status = SiloStatus::Active;
        seen.push(
            table
                .try_update_row(entry, version)
                .await
                .expect("update should succeed"),
        );

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_same_version_one_wins() {
        let table = InMemoryMembershipTable::new();
        let version = table
            .insert_row(
                MembershipEntry::joining(silo(1), "a", Duration::ZERO),
                MembershipVersion(0),
            )
            .await
            .expect("insert should succeed");

        let mut first = MembershipEntry::joining(silo(1), "a", Duration::ZERO);
        first.status = SiloStatus::Active;
        let mut second = first.clone();
        second.status = SiloStatus::Dead;

        assert!(table.try_update_row(first, version).await.is_ok());
        assert!(matches!(
            table.try_update_row(second, version).await,
            Err(MembershipError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_dead_row_cannot_be_resurrected() {
        let table = InMemoryMembershipTable::new();
        let mut entry = MembershipEntry::joining(silo(1), "a", Duration::ZERO);
        let v = table
            .insert_row(entry.clone(), MembershipVersion(0))
            .await
            .expect("insert should succeed");
        entry.status = SiloStatus::Dead;
        let v = table
            .try_update_row(entry.clone(), v)
            .await
            .expect("update should succeed");

        entry.status = SiloStatus::Active;
        assert_eq!(
            table.try_update_row(entry, v).await,
            Err(MembershipError::SiloDead { silo: silo(1) })
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let table = InMemoryMembershipTable::new();
        let v = table
            .insert_row(
                MembershipEntry::joining(silo(1), "a", Duration::ZERO),
                MembershipVersion(0),
            )
            .await
            .expect("insert should succeed");
        let result = table
            .insert_row(MembershipEntry::joining(silo(1), "a", Duration::ZERO), v)
            .await;
        assert!(matches!(result, Err(MembershipError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_injected_write_fault() {
        let faults = Rc::new(FaultInjector::new(1));
        faults.fail_next("membership.write", 1);
        let table = InMemoryMembershipTable::with_faults(faults);

        let entry = MembershipEntry::joining(silo(1), "a", Duration::ZERO);
        assert!(matches!(
            table.insert_row(entry.clone(), MembershipVersion(0)).await,
            Err(MembershipError::Storage(_))
        ));
        assert!(table.insert_row(entry, MembershipVersion(0)).await.is_ok());
    }

    #[test]
    fn test_fresh_votes_filter() {
        let mut entry = MembershipEntry::joining(silo(1), "a", Duration::ZERO);
        entry.suspect_votes = vec![
            SuspectVote {
                suspecter: silo(2),
                at: Duration::from_secs(10),
            },
            SuspectVote {
                suspecter: silo(3),
                at: Duration::from_secs(100),
            },
        ];
        let fresh = entry.fresh_votes(Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].suspecter, silo(3));
    }
}
