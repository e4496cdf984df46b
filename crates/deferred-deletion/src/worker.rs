//! The deferred-deletion worker proper (§4.6): the `add` entry point and
//! the per-tick sweep over the four queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use uds_domain::config::DeferredDeletionConfig;
use uds_domain::entities::{DeletionEntry, DeletionQueue, UserService};
use uds_domain::ids::ProviderId;
use uds_domain::{Error, Result, TaskState};
use uds_providers::ProviderPlugin;
use uds_store::Store;

use crate::queue::{apply_step, classify_error, classify_state, delay_rate, Disposition, Step};

const QUEUES: [DeletionQueue; 4] = [
    DeletionQueue::ToStop,
    DeletionQueue::Stopping,
    DeletionQueue::ToDelete,
    DeletionQueue::Deleting,
];

/// Owns one already-constructed plug-in instance per provider, same as
/// [`uds_cache::CacheUpdaterJob`] — adapters with in-memory state survive
/// across ticks instead of being rebuilt each time.
pub struct DeferredDeletionWorker {
    store: Arc<dyn Store>,
    providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
    cfg: DeferredDeletionConfig,
}

impl DeferredDeletionWorker {
    pub fn new(
        store: Arc<dyn Store>,
        providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
        cfg: DeferredDeletionConfig,
    ) -> Self {
        Self {
            store,
            providers,
            cfg,
        }
    }

    async fn provider_for(&self, us: &UserService) -> Result<Arc<dyn ProviderPlugin>> {
        let pool = self.store.get_pool_by_uuid(us.pool_id).await?;
        let service = self.store.get_service_by_uuid(pool.service_id).await?;
        let provider = self.store.get_provider_by_uuid(service.provider_id).await?;
        self.providers.get(&provider.uuid).cloned().ok_or_else(|| {
            Error::fatal(format!(
                "no plug-in instance registered for provider '{}'",
                provider.name
            ))
        })
    }

    /// Entry point `add(service, vmid, execute_later)` (§4.6). With
    /// `execute_later` set, the entry is queued directly at whichever
    /// queue its provider requires it to start in. Otherwise an inline
    /// fast-path delete is attempted first (§8 scenario S5's mocked,
    /// instant-responding provider never needs the queue at all); any
    /// failure along the way falls back to enqueuing instead of
    /// propagating.
    pub async fn add(
        &self,
        us: &UserService,
        vmid: impl Into<String>,
        execute_later: bool,
    ) -> Result<()> {
        let vmid = vmid.into();
        let now = self.store.now();
        let provider = self.provider_for(us).await?;

        if execute_later {
            let start = if provider.must_stop_before_deletion() {
                DeletionQueue::ToStop
            } else {
                DeletionQueue::ToDelete
            };
            return self.enqueue(us, vmid, start, now).await;
        }

        if provider.must_stop_before_deletion() {
            match provider.is_running(us).await {
                Ok(true) => return self.enqueue(us, vmid, DeletionQueue::ToStop, now).await,
                Ok(false) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(_) => return self.enqueue(us, vmid, DeletionQueue::ToStop, now).await,
            }
        }

        match provider.destroy(us).await {
            Ok(TaskState::Finished) => Ok(()),
            Ok(TaskState::Running) => self.enqueue(us, vmid, DeletionQueue::Deleting, now).await,
            Ok(TaskState::Error(reason)) => {
                debug!(%reason, "inline delete reported an error, falling back to the queue");
                self.enqueue(us, vmid, DeletionQueue::ToDelete, now).await
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(_) => self.enqueue(us, vmid, DeletionQueue::ToDelete, now).await,
        }
    }

    async fn enqueue(
        &self,
        us: &UserService,
        vmid: String,
        queue: DeletionQueue,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = DeletionEntry::new(vmid, us.uuid, queue, now);
        self.store.save_deletion_entry(entry).await?;
        Ok(())
    }

    /// One pass over all four queues (§4.6 steps 1-6).
    pub async fn tick(&self) -> Result<()> {
        let now = self.store.now();
        for queue in QUEUES {
            let due = self
                .store
                .due_deletion_entries(queue, now, self.cfg.max_deletions_at_once)
                .await?;
            for entry in due {
                if entry.total_retries >= self.cfg.max_retryable_error_retries {
                    self.store.delete_deletion_entry(entry.id).await?;
                    continue;
                }
                let id = entry.id;
                if let Err(e) = self.process_entry(entry, now).await {
                    warn!(entry = id, error = %e, "deferred deletion entry processing failed");
                }
            }
        }
        Ok(())
    }

    async fn process_entry(&self, entry: DeletionEntry, now: DateTime<Utc>) -> Result<()> {
        let id = entry.id;
        let us = match self.store.get_user_service_by_uuid(entry.service_uuid).await {
            Ok(us) => us,
            Err(e) if e.is_not_found() => {
                self.store.delete_deletion_entry(id).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let provider = self.provider_for(&us).await?;

        let start = Instant::now();
        let outcome = match entry.queue {
            DeletionQueue::ToStop => provider.stop(&us).await,
            DeletionQueue::Stopping => provider
                .is_running(&us)
                .await
                .map(|running| if running { TaskState::Running } else { TaskState::Finished }),
            DeletionQueue::ToDelete | DeletionQueue::Deleting => provider.destroy(&us).await,
        };
        let elapsed = chrono::Duration::from_std(start.elapsed()).unwrap_or(chrono::Duration::zero());
        let rate = delay_rate(elapsed, &self.cfg);

        let queue = entry.queue;
        let step = match outcome {
            Ok(state) => classify_state(queue, state),
            Err(e) => classify_error(&e),
        };
        // Resource confirmed gone (walked off the end of the queue chain,
        // or the provider reported NotFound outright) versus a retry
        // budget simply running out: only the former means the backing
        // resource is actually destroyed.
        let confirmed_gone = matches!(step, Step::NotFound)
            || (matches!(step, Step::Advance) && queue == DeletionQueue::Deleting);

        match apply_step(entry, step, rate, &self.cfg, now) {
            Disposition::Requeue(next) => {
                self.store.save_deletion_entry(next).await?;
            }
            Disposition::Discard => {
                self.store.delete_deletion_entry(id).await?;
                if confirmed_gone {
                    uds_userservice::mark_removed(self.store.as_ref(), us.id).await?;
                } else {
                    warn!(
                        user_service = %us.uuid,
                        "deferred deletion gave up before confirming the backing resource was gone"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uds_domain::entities::{CacheLevel, OsState, Provider, Service, ServicePool, ServicePoolState, UserServiceState};
    use uds_domain::ids::{ServiceId, ServicePoolId, UserServiceId};
    use uds_providers::TestProvider;
    use uds_store::MemoryStore;

    async fn seed(store: &MemoryStore, must_stop: bool) -> (UserService, Arc<TestProvider>) {
        let test_plugin = Arc::new(if must_stop {
            TestProvider::with_stop_before_deletion()
        } else {
            TestProvider::new()
        });

        let provider_row = store
            .save_provider(Provider {
                id: 0,
                uuid: ProviderId::new(),
                name: "p".into(),
                data_type: "test".into(),
                maintenance_mode: false,
                concurrent_creation_limit: 10,
                concurrent_removal_limit: 10,
            })
            .await
            .unwrap();

        let service_row = store
            .save_service(Service {
                id: 0,
                uuid: ServiceId::new(),
                provider_id: provider_row.uuid,
                name: "svc".into(),
                token: None,
                max_services_count_type: uds_domain::entities::MaxServicesCountType::Absolute,
                max_services_count: 0,
                uses_cache: true,
                uses_cache_l2: false,
                needs_publication: false,
            })
            .await
            .unwrap();

        let pool_row = ServicePool {
            id: 0,
            uuid: ServicePoolId::new(),
            name: "pool".into(),
            service_id: service_row.uuid,
            state: ServicePoolState::Active,
            initial_srvs: 0,
            cache_l1_srvs: 0,
            cache_l2_srvs: 0,
            max_srvs: 5,
            current_pub_revision: None,
            current_publication_id: None,
            osmanager_id: None,
            transports: vec![],
            assigned_groups: vec![],
            show_transports: true,
            visible: true,
            allow_users_remove: false,
            allow_users_reset: false,
            calendar_rules: vec![],
            fallback_access: uds_domain::entities::AccessAction::Allow,
        };

        let saved_pool = store.save_pool(pool_row).await.unwrap();
        let us = UserService {
            id: 0,
            uuid: UserServiceId::new(),
            pool_id: saved_pool.uuid,
            state: UserServiceState::Removable,
            os_state: OsState::Usable,
            cache_level: CacheLevel::Assigned,
            user_id: None,
            account_id: None,
            publication_id: None,
            publication_revision: None,
            unique_id: None,
            in_use: false,
            in_use_date: None,
            src_ip: None,
            src_hostname: None,
            creation_date: Utc::now(),
            state_date: Utc::now(),
            error_reason: None,
            to_be_replaced: false,
            destroy_after: false,
            data: vec![],
            properties: Default::default(),
        };
        let saved_us = store.insert_user_service(us).await.unwrap();
        (saved_us, test_plugin)
    }

    async fn providers_for(store: &MemoryStore, plugin: Arc<TestProvider>) -> HashMap<ProviderId, Arc<dyn ProviderPlugin>> {
        let mut providers = HashMap::new();
        for p in store.list_pools().await.unwrap() {
            let service = store.get_service_by_uuid(p.service_id).await.unwrap();
            providers.insert(service.provider_id, plugin.clone() as Arc<dyn ProviderPlugin>);
        }
        providers
    }

    #[tokio::test]
    async fn add_with_execute_later_enqueues_without_calling_the_provider() {
        let store = Arc::new(MemoryStore::new());
        let (us, plugin) = seed(&store, true).await;
        let providers = providers_for(&store, plugin).await;

        let worker = DeferredDeletionWorker::new(store.clone(), providers, DeferredDeletionConfig::default());
        worker.add(&us, "vm-1", true).await.unwrap();

        let queued = store.list_deletion_entries(DeletionQueue::ToStop).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].service_uuid, us.uuid);
    }

    #[tokio::test]
    async fn full_queue_trajectory_discards_once_deleting_finishes() {
        let store = Arc::new(MemoryStore::new());
        let (us, plugin) = seed(&store, true).await;
        plugin.mark_running(us.id, true);
        let providers = providers_for(&store, plugin.clone()).await;

        let cfg = DeferredDeletionConfig::default();
        let worker = DeferredDeletionWorker::new(store.clone(), providers, cfg.clone());
        worker.add(&us, "vm-1", true).await.unwrap();

        // Each step schedules next_check check_interval_secs out; due_deletion_entries
        // only returns rows whose next_check has arrived, so the store's clock has to
        // move forward between ticks the same way it would between real scheduler runs.
        let step = chrono::Duration::seconds(i64::from(cfg.check_interval_secs) + 1);

        // TO_STOP -> STOPPING
        worker.tick().await.unwrap();
        assert_eq!(store.list_deletion_entries(DeletionQueue::Stopping).await.unwrap().len(), 1);

        // Still running: stays in STOPPING.
        store.advance_clock(step);
        worker.tick().await.unwrap();
        assert_eq!(store.list_deletion_entries(DeletionQueue::Stopping).await.unwrap().len(), 1);

        plugin.mark_running(us.id, false);
        // STOPPING -> TO_DELETE
        store.advance_clock(step);
        worker.tick().await.unwrap();
        assert_eq!(store.list_deletion_entries(DeletionQueue::ToDelete).await.unwrap().len(), 1);

        // TO_DELETE -> DELETING
        store.advance_clock(step);
        worker.tick().await.unwrap();
        assert_eq!(store.list_deletion_entries(DeletionQueue::Deleting).await.unwrap().len(), 1);

        // DELETING -> discarded (TestProvider::destroy always finishes immediately).
        store.advance_clock(step);
        worker.tick().await.unwrap();
        assert_eq!(store.list_deletion_entries(DeletionQueue::Deleting).await.unwrap().len(), 0);
        assert_eq!(store.list_deletion_entries(DeletionQueue::ToStop).await.unwrap().len(), 0);
    }
}
