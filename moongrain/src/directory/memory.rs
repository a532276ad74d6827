//! Single-store directory backend.

use super::{DirectoryError, DirectoryPartition, GrainDirectory};
use crate::types::{GrainAddress, GrainId, SiloAddress};

/// Directory backed by one shared in-memory store.
///
/// Stands in for an external directory backend: every silo of a process
/// shares the same instance, so there is no partitioning and no handoff.
/// Records on dead silos are purged through
/// [`unregister_silos`](GrainDirectory::unregister_silos), which each silo
/// calls on every membership view change.
#[derive(Debug, Default)]
pub struct InMemoryGrainDirectory {
    store: DirectoryPartition,
}

impl InMemoryGrainDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered grains.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no grain is registered.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait::async_trait(?Send)]
impl GrainDirectory for InMemoryGrainDirectory {
    async fn register(&self, address: GrainAddress) -> Result<GrainAddress, DirectoryError> {
        Ok(self.store.register(address, |_| true))
    }

    async fn lookup(&self, grain: &GrainId) -> Result<Option<GrainAddress>, DirectoryError> {
        Ok(self.store.lookup(grain))
    }

    async fn unregister(&self, address: &GrainAddress) -> Result<(), DirectoryError> {
        self.store.unregister(address);
        Ok(())
    }

    async fn unregister_silos(&self, silos: &[SiloAddress]) -> Result<(), DirectoryError> {
        self.store.unregister_silos(silos);
        Ok(())
    }
}
