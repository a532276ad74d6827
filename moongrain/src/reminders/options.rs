//! Reminder settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the reminder service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderOptions {
    /// Shortest accepted period.
    pub minimum_period: Duration,
    /// How often owned ranges are reloaded from the table.
    pub refresh_interval: Duration,
    /// Timeout for the notification sent to a reminder's owning silo.
    pub notify_timeout: Duration,
}

impl Default for ReminderOptions {
    fn default() -> Self {
        Self {
            minimum_period: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(300),
            notify_timeout: Duration::from_secs(5),
        }
    }
}

impl ReminderOptions {
    /// Short intervals for tests running on a paused clock.
    pub fn for_simulation() -> Self {
        Self {
            minimum_period: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5),
            notify_timeout: Duration::from_millis(500),
        }
    }
}
