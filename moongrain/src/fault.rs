//! Deterministic fault injection for storage backends.
//!
//! In-memory backends (membership table, transactional state storage,
//! transaction log, reminder table) consult a shared [`FaultInjector`] at
//! named sites before performing an operation. A site fires either because
//! a one-shot failure was armed for it or because its configured probability
//! hit on the seeded RNG, so a run with the same seed fails the same way.
//!
//! Sites are plain strings. A backend checks a specific site first (for
//! example `"storage.prepare/acc00001/bob"`) and then its generic prefix
//! (`"storage.prepare"`), so tests can target one grain or all of them.

use std::cell::RefCell;
use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Default)]
struct SiteState {
    probability: f64,
    armed: u32,
    fired: u64,
}

/// Seeded, per-site fault source.
#[derive(Debug)]
pub struct FaultInjector {
    rng: RefCell<ChaCha8Rng>,
    sites: RefCell<HashMap<String, SiteState>>,
}

impl FaultInjector {
    /// Create an injector with no active sites.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed)),
            sites: RefCell::new(HashMap::new()),
        }
    }

    /// Make `site` fail with the given probability on every check.
    pub fn set_probability(&self, site: impl Into<String>, probability: f64) {
        self.sites
            .borrow_mut()
            .entry(site.into())
            .or_default()
            .probability = probability.clamp(0.0, 1.0);
    }

    /// Make the next `count` checks of `site` fail.
    pub fn fail_next(&self, site: impl Into<String>, count: u32) {
        self.sites.borrow_mut().entry(site.into()).or_default().armed += count;
    }

    /// Disable every site.
    pub fn clear(&self) {
        self.sites.borrow_mut().clear();
    }

    /// Number of times `site` has fired.
    pub fn fired(&self, site: &str) -> u64 {
        self.sites.borrow().get(site).map_or(0, |s| s.fired)
    }

    /// Whether the operation guarded by `site` should fail now.
    pub fn should_fail(&self, site: &str) -> bool {
        let mut sites = self.sites.borrow_mut();
        let Some(state) = sites.get_mut(site) else {
            return false;
        };
        let fire = if state.armed > 0 {
            state.armed -= 1;
            true
        } else if state.probability > 0.0 {
            self.rng.borrow_mut().random::<f64>() < state.probability
        } else {
            false
        };
        if fire {
            state.fired += 1;
            tracing::debug!(site, "injected fault");
        }
        fire
    }

    /// Check `specific` first, then `generic`.
    pub fn should_fail_any(&self, specific: &str, generic: &str) -> bool {
        self.should_fail(specific) || self.should_fail(generic)
    }
}
