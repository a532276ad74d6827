//! Durable, at-least-once periodic callbacks.
//!
//! A reminder is a row in the [`ReminderTable`] keyed by grain and name.
//! It fires on whichever silo owns the grain's hash on the ring of Active
//! silos, so reminders are partitioned exactly like the grain directory.
//!
//! # Design
//!
//! - The table is the only source of truth. On every membership view change
//!   a silo drops the timers outside its new ranges and reloads its ranges
//!   from the table. A periodic refresh catches rows changed without a
//!   notification.
//! - Registering or removing a reminder writes the table and then tells the
//!   owning silo to reload that one row.
//! - Tick times are derived from the row (`start_at + k * period`), never
//!   from in-memory history, so a silo taking over a range resumes the same
//!   schedule. A tick that was in flight when its silo died fires again on
//!   the new owner: delivery is at-least-once.

mod options;
mod service;
mod table;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use options::ReminderOptions;
pub use service::{next_tick, ReminderDelivery, ReminderService, TickStatus};
pub use table::{InMemoryReminderTable, ReminderEntry, ReminderHandle, ReminderTable};

use crate::error::StorageError;
use crate::types::GrainId;

/// Errors from reminder operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReminderError {
    /// The requested period is below the configured minimum.
    #[error("reminder period {period:?} is below the minimum {minimum:?}")]
    PeriodTooShort {
        /// Requested period.
        period: Duration,
        /// Configured minimum.
        minimum: Duration,
    },

    /// No such reminder, or it changed since the handle was obtained.
    #[error("reminder {name} of {grain} not found")]
    NotFound {
        /// The grain.
        grain: GrainId,
        /// Reminder name.
        name: String,
    },

    /// The reminder table failed.
    #[error("reminder table: {0}")]
    Storage(#[from] StorageError),
}
