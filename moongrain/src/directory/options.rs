//! Directory settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the distributed directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryOptions {
    /// Timeout for one directory request to a partition owner.
    pub request_timeout: Duration,
    /// Re-routes allowed after `NotOwner` or an unreachable owner.
    pub max_hops: u32,
    /// Pause before re-routing.
    pub retry_backoff: Duration,
    /// Timeout for handoff transfers during rebalancing.
    pub handoff_timeout: Duration,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_hops: 5,
            retry_backoff: Duration::from_millis(200),
            handoff_timeout: Duration::from_secs(10),
        }
    }
}

impl DirectoryOptions {
    /// Short timeouts for tests running on a paused clock.
    pub fn for_simulation() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            max_hops: 5,
            retry_backoff: Duration::from_millis(50),
            handoff_timeout: Duration::from_secs(1),
        }
    }
}
