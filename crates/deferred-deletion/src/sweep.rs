//! Removal sweep (§4.3 "Scheduler sweeps REMOVABLE"): the other half of
//! the deferred-deletion worker's `add` entry point actually getting
//! called. Every tick, walks every `Removable` UserService not already
//! in one of the four queues and either destroys it inline (providers
//! that don't require a stop step first) or hands it to
//! [`DeferredDeletionWorker::add`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use uds_domain::entities::{DeletionQueue, UserServiceState};
use uds_domain::ids::{ProviderId, UserServiceId};
use uds_domain::Result;
use uds_providers::ProviderPlugin;
use uds_scheduler::job::Job;
use uds_store::Store;

use crate::worker::DeferredDeletionWorker;

const QUEUES: [DeletionQueue; 4] = [
    DeletionQueue::ToStop,
    DeletionQueue::Stopping,
    DeletionQueue::ToDelete,
    DeletionQueue::Deleting,
];

/// [`Job`] that dispatches `Removable` rows to
/// [`uds_userservice::destroy_once`] or [`DeferredDeletionWorker::add`].
pub struct RemovalSweepJob {
    store: Arc<dyn Store>,
    providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
    worker: Arc<DeferredDeletionWorker>,
    frequency_seconds: u32,
}

impl RemovalSweepJob {
    pub fn new(
        store: Arc<dyn Store>,
        providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
        worker: Arc<DeferredDeletionWorker>,
        frequency_seconds: u32,
    ) -> Self {
        Self {
            store,
            providers,
            worker,
            frequency_seconds,
        }
    }

    async fn already_queued(&self) -> Result<HashSet<UserServiceId>> {
        let mut seen = HashSet::new();
        for queue in QUEUES {
            for entry in self.store.list_deletion_entries(queue).await? {
                seen.insert(entry.service_uuid);
            }
        }
        Ok(seen)
    }
}

#[async_trait]
impl Job for RemovalSweepJob {
    fn name(&self) -> &str {
        "removal_sweep"
    }

    fn friendly_name(&self) -> &str {
        "UserService Removal Sweep"
    }

    fn frequency_seconds(&self) -> u32 {
        self.frequency_seconds
    }

    async fn run(&self) -> Result<()> {
        let queued = self.already_queued().await?;

        for pool in self.store.list_pools().await? {
            let service = self.store.get_service_by_uuid(pool.service_id).await?;
            let provider = self.store.get_provider_by_uuid(service.provider_id).await?;
            let Some(plugin) = self.providers.get(&provider.uuid) else {
                warn!(provider = %provider.name, "no plug-in instance registered for provider, skipping pool's removal sweep");
                continue;
            };

            let rows = self.store.list_user_services_by_pool(pool.id).await?;
            for row in rows {
                if row.state != UserServiceState::Removable || queued.contains(&row.uuid) {
                    continue;
                }

                if plugin.must_stop_before_deletion() {
                    let vmid = plugin
                        .get_unique_id(&row)
                        .await?
                        .unwrap_or_else(|| plugin.get_name(&row));
                    self.worker.add(&row, vmid, true).await?;
                } else if let Err(e) = uds_userservice::destroy_once(self.store.as_ref(), plugin.as_ref(), row.id).await
                {
                    warn!(user_service = %row.uuid, error = %e, "inline destroy failed during removal sweep");
                }
            }
        }
        Ok(())
    }
}
