//! Contended sequential allocator façade (§4.2).
//!
//! [`uds_store::Store::claim_unique_id`] already implements the
//! smallest-free-then-high-water-mark algorithm under a row lock; this
//! type is the thin, typed entry point the rest of the engine calls
//! through, plus the `NOT_AVAILABLE` → `Option::None` mapping callers
//! match on.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use uds_domain::Result;
use uds_store::Store;

/// Wraps a [`Store`] with the allocator's narrower contract: every method
/// here maps directly onto one of the `*_unique_id*` Store operations.
#[derive(Clone)]
pub struct UniqueIdAllocator {
    store: Arc<dyn Store>,
}

impl UniqueIdAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Claims the next free `seq` for `basename` within `range`, owned by
    /// `owner`. `Ok(None)` means `NOT_AVAILABLE`: the range is exhausted
    /// and it is the caller's policy whether to surface this to the user
    /// or provision more capacity.
    pub async fn allocate(
        &self,
        owner: &str,
        basename: &str,
        range: (u64, u64),
    ) -> Result<Option<u64>> {
        let claimed = self.store.claim_unique_id(basename, owner, range).await?;
        if claimed.is_none() {
            debug!(basename, owner, ?range, "unique id range exhausted");
        }
        Ok(claimed.map(|row| row.seq))
    }

    /// Releases `seq` back to the free pool and purges any unassigned
    /// high-water-mark rows above it.
    pub async fn free(&self, basename: &str, seq: u64) -> Result<()> {
        self.store.release_unique_id(basename, seq).await
    }

    /// Reassigns `seq` to `new_owner` without freeing and reclaiming it,
    /// e.g. when a cache-level move hands an instance to a different
    /// UserService without tearing down its network identity.
    pub async fn transfer(&self, basename: &str, seq: u64, new_owner: &str) -> Result<()> {
        self.store
            .transfer_unique_id(basename, seq, new_owner)
            .await
    }

    /// Releases every row owned by `owner` across every basename. Called
    /// when the owning UserService is destroyed so every generator it
    /// ever drew from gives its slot back.
    pub async fn release_all(&self, owner: &str) -> Result<usize> {
        self.store.release_unique_ids_owned_by(owner).await
    }

    /// Releases assigned rows for `basename` whose stamp predates
    /// `max_age`. Per §9, this scan-then-update is not itself taken
    /// under a single lock, so the effective cutoff can drift slightly
    /// under heavy concurrent load; acceptable for a housekeeping pass.
    pub async fn release_older_than(&self, basename: &str, max_age: Duration) -> Result<usize> {
        self.store
            .release_unique_ids_older_than(basename, max_age)
            .await
    }
}
