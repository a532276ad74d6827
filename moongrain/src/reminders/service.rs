//! Per-silo reminder service.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{ReminderEntry, ReminderError, ReminderHandle, ReminderOptions, ReminderTable};
use crate::error::GrainError;
use crate::membership::{MembershipOracle, MembershipSnapshot};
use crate::ring::RingRange;
use crate::time::TimeProvider;
use crate::transport::{SiloMessage, SiloTransport};
use crate::types::{GrainId, SiloAddress};

/// Tick information handed to the grain. Times are wall clock since the
/// UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStatus {
    /// First tick of the reminder.
    pub first_tick: Duration,
    /// Period.
    pub period: Duration,
    /// Scheduled time of this tick.
    pub current_tick_time: Duration,
}

/// Where ticks go: the runtime routes them to the grain, activating it if
/// needed.
#[async_trait::async_trait(?Send)]
pub trait ReminderDelivery {
    /// Deliver one tick of reminder `name` to `grain`.
    async fn deliver_reminder(
        &self,
        grain: &GrainId,
        name: &str,
        status: TickStatus,
    ) -> Result<(), GrainError>;
}

/// First scheduled tick at or after `now`: `start_at` if it is still
/// ahead, else the next `start_at + k * period` strictly after `now`.
pub fn next_tick(start_at: Duration, period: Duration, now: Duration) -> Duration {
    if start_at >= now {
        start_at
    } else {
        tick_after(start_at, period, now)
    }
}

/// First scheduled tick strictly after `t`.
fn tick_after(start_at: Duration, period: Duration, t: Duration) -> Duration {
    if t < start_at || period.is_zero() {
        return start_at.max(t);
    }
    let periods = (t - start_at).as_nanos() / period.as_nanos() + 1;
    let offset = period.as_nanos() * periods;
    start_at + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
}

struct Armed {
    entry: ReminderEntry,
    task: JoinHandle<()>,
}

/// Arms timers for the reminders whose grains hash into this silo's ring
/// ranges.
pub struct ReminderService {
    local: SiloAddress,
    oracle: Rc<MembershipOracle>,
    table: Rc<dyn ReminderTable>,
    transport: Rc<dyn SiloTransport>,
    time: Rc<dyn TimeProvider>,
    options: ReminderOptions,
    delivery: Weak<dyn ReminderDelivery>,
    ranges: RefCell<Vec<RingRange>>,
    armed: RefCell<HashMap<(GrainId, String), Armed>>,
    this: Weak<ReminderService>,
}

impl fmt::Debug for ReminderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderService")
            .field("local", &self.local)
            .field("ranges", &self.ranges.borrow().len())
            .field("armed", &self.armed.borrow().len())
            .finish()
    }
}

impl ReminderService {
    /// Create the service of the oracle's silo. Ticks are delivered through
    /// `delivery`.
    pub fn new(
        oracle: Rc<MembershipOracle>,
        table: Rc<dyn ReminderTable>,
        transport: Rc<dyn SiloTransport>,
        time: Rc<dyn TimeProvider>,
        options: ReminderOptions,
        delivery: Weak<dyn ReminderDelivery>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            local: oracle.local().clone(),
            oracle,
            table,
            transport,
            time,
            options,
            delivery,
            ranges: RefCell::new(Vec::new()),
            armed: RefCell::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Names of the reminders with a running timer on this silo.
    pub fn armed(&self) -> Vec<(GrainId, String)> {
        let mut armed: Vec<_> = self.armed.borrow().keys().cloned().collect();
        armed.sort();
        armed
    }

    /// Create or replace reminder `name` of `grain`. The first tick is
    /// `due` from now.
    pub async fn register_or_update(
        &self,
        grain: &GrainId,
        name: &str,
        due: Duration,
        period: Duration,
    ) -> Result<ReminderHandle, ReminderError> {
        if period < self.options.minimum_period {
            return Err(ReminderError::PeriodTooShort {
                period,
                minimum: self.options.minimum_period,
            });
        }
        let mut entry = ReminderEntry {
            grain: grain.clone(),
            name: name.to_string(),
            start_at: self.time.timer() + due,
            period,
            etag: 0,
        };
        entry.etag = self.table.upsert_row(entry.clone()).await?;
        tracing::info!(silo = %self.local, grain = %grain, name, ?period, "reminder registered");
        self.notify_owner(grain, name).await;
        Ok(entry.handle())
    }

    /// Remove the reminder `handle` names.
    pub async fn unregister(&self, handle: &ReminderHandle) -> Result<(), ReminderError> {
        let removed = self
            .table
            .remove_row(&handle.grain, &handle.name, handle.etag)
            .await?;
        if !removed {
            return Err(ReminderError::NotFound {
                grain: handle.grain.clone(),
                name: handle.name.clone(),
            });
        }
        tracing::info!(silo = %self.local, grain = %handle.grain, name = %handle.name, "reminder unregistered");
        self.notify_owner(&handle.grain, &handle.name).await;
        Ok(())
    }

    /// One reminder of `grain`.
    pub async fn get_reminder(
        &self,
        grain: &GrainId,
        name: &str,
    ) -> Result<Option<ReminderEntry>, ReminderError> {
        Ok(self.table.read_row(grain, name).await?)
    }

    /// Every reminder of `grain`.
    pub async fn get_reminders(
        &self,
        grain: &GrainId,
    ) -> Result<Vec<ReminderEntry>, ReminderError> {
        Ok(self.table.read_grain_rows(grain).await?)
    }

    async fn notify_owner(&self, grain: &GrainId, name: &str) {
        let owner = self.oracle.current().ring().owner_of(grain).cloned();
        match owner {
            Some(owner) if owner == self.local => self.on_reminder_changed(grain, name).await,
            Some(owner) => {
                let message = SiloMessage::ReminderChanged {
                    grain: grain.clone(),
                    name: name.to_string(),
                };
                let sent = self
                    .transport
                    .send(&self.local, &owner, message, self.options.notify_timeout)
                    .await;
                if let Err(e) = sent {
                    tracing::warn!(silo = %self.local, owner = %owner, grain = %grain, error = %e, "reminder owner not notified, relying on refresh");
                }
            }
            None => {}
        }
    }

    fn owns(&self, grain: &GrainId) -> bool {
        let hash = grain.uniform_hash();
        self.ranges.borrow().iter().any(|r| r.contains(hash))
    }

    /// Reload one row after it changed.
    pub async fn on_reminder_changed(&self, grain: &GrainId, name: &str) {
        if !self.owns(grain) {
            return;
        }
        match self.table.read_row(grain, name).await {
            Ok(Some(entry)) => self.arm(entry),
            Ok(None) => self.disarm(grain, name),
            Err(e) => {
                tracing::warn!(silo = %self.local, grain = %grain, name, error = %e, "reminder reload failed");
            }
        }
    }

    /// Adopt the ranges of `view` and reload them from the table.
    pub async fn on_view_change(&self, view: Rc<MembershipSnapshot>) {
        let ranges = if view.is_active(&self.local) {
            view.ring().ranges_of(&self.local)
        } else {
            Vec::new()
        };
        *self.ranges.borrow_mut() = ranges;

        let dropped: Vec<(GrainId, String)> = self
            .armed
            .borrow()
            .keys()
            .filter(|(grain, _)| !self.owns(grain))
            .cloned()
            .collect();
        for (grain, name) in &dropped {
            self.disarm(grain, name);
        }
        if !dropped.is_empty() {
            tracing::info!(silo = %self.local, version = %view.version, dropped = dropped.len(), "reminders moved to other silos");
        }

        self.reload().await;
    }

    /// Re-read every owned range and reconcile the timers with it.
    pub async fn reload(&self) {
        let ranges = self.ranges.borrow().clone();
        let mut rows: HashMap<(GrainId, String), ReminderEntry> = HashMap::new();
        for range in &ranges {
            match self.table.read_rows(range).await {
                Ok(entries) => {
                    for entry in entries {
                        rows.insert((entry.grain.clone(), entry.name.clone()), entry);
                    }
                }
                Err(e) => {
                    // Keep the current timers; the next refresh retries.
                    tracing::warn!(silo = %self.local, range = %range, error = %e, "reminder range load failed");
                    return;
                }
            }
        }

        let stale: Vec<(GrainId, String)> = self
            .armed
            .borrow()
            .keys()
            .filter(|key| !rows.contains_key(*key))
            .cloned()
            .collect();
        for (grain, name) in &stale {
            self.disarm(grain, name);
        }

        let mut started = 0;
        for (key, entry) in rows {
            let current = self.armed.borrow().get(&key).map(|a| a.entry.etag);
            if current != Some(entry.etag) {
                self.arm(entry);
                started += 1;
            }
        }
        if started > 0 {
            tracing::info!(silo = %self.local, started, "reminders armed");
        }
    }

    /// Reload owned ranges every `refresh_interval` until the silo stops.
    pub async fn refresh_loop(self: Rc<Self>) {
        loop {
            self.time.sleep(self.options.refresh_interval).await;
            if self.oracle.is_terminated() {
                break;
            }
            self.reload().await;
        }
    }

    /// Stop every timer.
    pub fn stop(&self) {
        self.ranges.borrow_mut().clear();
        for (_, armed) in self.armed.borrow_mut().drain() {
            armed.task.abort();
        }
    }

    fn arm(&self, entry: ReminderEntry) {
        let key = (entry.grain.clone(), entry.name.clone());
        let task = tokio::task::spawn_local(tick_loop(self.this.clone(), entry.clone()));
        tracing::debug!(silo = %self.local, grain = %entry.grain, name = %entry.name, "reminder timer armed");
        if let Some(previous) = self.armed.borrow_mut().insert(key, Armed { entry, task }) {
            previous.task.abort();
        }
    }

    fn disarm(&self, grain: &GrainId, name: &str) {
        let removed = self
            .armed
            .borrow_mut()
            .remove(&(grain.clone(), name.to_string()));
        if let Some(armed) = removed {
            armed.task.abort();
            tracing::debug!(silo = %self.local, grain = %grain, name, "reminder timer disarmed");
        }
    }
}

async fn tick_loop(service: Weak<ReminderService>, entry: ReminderEntry) {
    let first_tick = {
        let Some(service) = service.upgrade() else {
            return;
        };
        next_tick(entry.start_at, entry.period, service.time.timer())
    };
    let mut tick = first_tick;
    loop {
        let Some(svc) = service.upgrade() else {
            return;
        };
        let time = svc.time.clone();
        drop(svc);
        let now = time.timer();
        if tick > now {
            time.sleep(tick - now).await;
        }

        let Some(svc) = service.upgrade() else {
            return;
        };
        let Some(delivery) = svc.delivery.upgrade() else {
            return;
        };
        let status = TickStatus {
            first_tick,
            period: entry.period,
            current_tick_time: tick,
        };
        if let Err(e) = delivery
            .deliver_reminder(&entry.grain, &entry.name, status)
            .await
        {
            tracing::warn!(silo = %svc.local, grain = %entry.grain, name = %entry.name, error = %e, "reminder delivery failed");
        }
        if entry.period.is_zero() {
            return;
        }
        tick = tick_after(entry.start_at, entry.period, tick.max(time.timer()));
    }
}
