//! Cleanup pass (§3, §4.3): "REMOVED rows with no external references are
//! purged by the cleanup job". Runs as its own scheduled job rather than
//! piggybacking on the FSM sweep, since it walks every pool rather than
//! advancing one row's state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;

use uds_domain::entities::UserServiceState;
use uds_domain::config::StoreConfig;
use uds_domain::Result;
use uds_scheduler::job::Job;
use uds_store::Store;

/// Deletes every `Removed` row whose `state_date` predates
/// `keep_info_time`, freeing any unique-id allocations it still owns
/// first (the UserService's own uuid is the allocator's `owner` key, per
/// the same convention `notify_event`'s server token relies on).
pub async fn purge_removed(
    store: &dyn Store,
    allocator: &uds_allocator::UniqueIdAllocator,
    keep_info_time: Duration,
) -> Result<usize> {
    let now = store.now();
    let cutoff = now - keep_info_time;
    let mut purged = 0usize;

    for pool in store.list_pools().await? {
        let rows = store.list_user_services_by_pool(pool.id).await?;
        for row in rows {
            if row.state != UserServiceState::Removed || row.state_date > cutoff {
                continue;
            }
            allocator.release_all(&row.uuid.to_string()).await?;
            store.delete_user_service(row.id).await?;
            purged += 1;
        }
    }

    if purged > 0 {
        debug!(purged, "cleanup pass purged removed user services");
    }
    Ok(purged)
}

/// [`Job`] wrapper driving [`purge_removed`] on `StoreConfig::cleanup_check`.
pub struct CleanupJob {
    store: Arc<dyn Store>,
    allocator: uds_allocator::UniqueIdAllocator,
    cfg: StoreConfig,
}

impl CleanupJob {
    pub fn new(store: Arc<dyn Store>, allocator: uds_allocator::UniqueIdAllocator, cfg: StoreConfig) -> Self {
        Self { store, allocator, cfg }
    }
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &str {
        "user_service_cleanup"
    }

    fn friendly_name(&self) -> &str {
        "Removed UserService Cleanup"
    }

    fn frequency_seconds(&self) -> u32 {
        self.cfg.cleanup_check
    }

    async fn run(&self) -> Result<()> {
        purge_removed(
            self.store.as_ref(),
            &self.allocator,
            Duration::seconds(self.cfg.keep_info_time as i64),
        )
        .await?;
        Ok(())
    }
}
