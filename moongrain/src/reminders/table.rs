//! Reminder table contract and in-memory backend.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::fault::FaultInjector;
use crate::ring::RingRange;
use crate::types::GrainId;

/// One durable reminder row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderEntry {
    /// The grain to remind.
    pub grain: GrainId,
    /// Reminder name, unique per grain.
    pub name: String,
    /// First tick, wall clock since the UNIX epoch.
    pub start_at: Duration,
    /// Interval between ticks.
    pub period: Duration,
    /// Row version, assigned by the table on every upsert.
    pub etag: u64,
}

impl ReminderEntry {
    /// The handle for this row.
    pub fn handle(&self) -> ReminderHandle {
        ReminderHandle {
            grain: self.grain.clone(),
            name: self.name.clone(),
            etag: self.etag,
        }
    }
}

/// What a registration returns; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderHandle {
    /// The grain.
    pub grain: GrainId,
    /// Reminder name.
    pub name: String,
    /// Row version at registration.
    pub etag: u64,
}

/// Pluggable durable reminder storage.
#[async_trait::async_trait(?Send)]
pub trait ReminderTable: fmt::Debug {
    /// Rows whose grain hash falls in `range`.
    async fn read_rows(&self, range: &RingRange) -> Result<Vec<ReminderEntry>, StorageError>;

    /// One row.
    async fn read_row(
        &self,
        grain: &GrainId,
        name: &str,
    ) -> Result<Option<ReminderEntry>, StorageError>;

    /// Every row of `grain`.
    async fn read_grain_rows(&self, grain: &GrainId) -> Result<Vec<ReminderEntry>, StorageError>;

    /// Insert or replace a row. The `etag` of `entry` is ignored; the new
    /// one is returned.
    async fn upsert_row(&self, entry: ReminderEntry) -> Result<u64, StorageError>;

    /// Remove a row if its etag still matches. Returns whether it was
    /// removed.
    async fn remove_row(
        &self,
        grain: &GrainId,
        name: &str,
        etag: u64,
    ) -> Result<bool, StorageError>;
}

/// In-memory [`ReminderTable`]. Fault sites: `reminders.read`,
/// `reminders.write`.
#[derive(Debug, Default)]
pub struct InMemoryReminderTable {
    rows: RefCell<BTreeMap<(GrainId, String), ReminderEntry>>,
    next_etag: Cell<u64>,
    faults: Option<Rc<FaultInjector>>,
}

impl InMemoryReminderTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table that consults `faults`.
    pub fn with_faults(faults: Rc<FaultInjector>) -> Self {
        Self {
            faults: Some(faults),
            ..Self::default()
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    fn check(&self, site: &'static str) -> Result<(), StorageError> {
        match &self.faults {
            Some(faults) if faults.should_fail(site) => {
                Err(StorageError::Injected { site: site.into() })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait(?Send)]
impl ReminderTable for InMemoryReminderTable {
    async fn read_rows(&self, range: &RingRange) -> Result<Vec<ReminderEntry>, StorageError> {
        self.check("reminders.read")?;
        Ok(self
            .rows
            .borrow()
            .values()
            .filter(|e| range.contains(e.grain.uniform_hash()))
            .cloned()
            .collect())
    }

    async fn read_row(
        &self,
        grain: &GrainId,
        name: &str,
    ) -> Result<Option<ReminderEntry>, StorageError> {
        self.check("reminders.read")?;
        Ok(self
            .rows
            .borrow()
            .get(&(grain.clone(), name.to_string()))
            .cloned())
    }

    async fn read_grain_rows(&self, grain: &GrainId) -> Result<Vec<ReminderEntry>, StorageError> {
        self.check("reminders.read")?;
        Ok(self
            .rows
            .borrow()
            .values()
            .filter(|e| &e.grain == grain)
            .cloned()
            .collect())
    }

    async fn upsert_row(&self, mut entry: ReminderEntry) -> Result<u64, StorageError> {
        self.check("reminders.write")?;
        let etag = self.next_etag.get() + 1;
        self.next_etag.set(etag);
        entry.etag = etag;
        self.rows
            .borrow_mut()
            .insert((entry.grain.clone(), entry.name.clone()), entry);
        Ok(etag)
    }

    async fn remove_row(
        &self,
        grain: &GrainId,
        name: &str,
        etag: u64,
    ) -> Result<bool, StorageError> {
        self.check("reminders.write")?;
        let mut rows = self.rows.borrow_mut();
        let key = (grain.clone(), name.to_string());
        match rows.get(&key) {
            Some(entry) if entry.etag == etag => {
                rows.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
