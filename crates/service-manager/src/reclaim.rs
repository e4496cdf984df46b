//! Idle-assignment reclaim (§6 `CHECK_UNUSED_TIME`): an assigned
//! UserService a user never actually connected to (or logged out of and
//! never came back for) is eventually handed back to the pool rather
//! than sitting on the user's slot forever.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;

use uds_domain::config::PolicyConfig;
use uds_domain::entities::{CacheLevel, UserServiceState};
use uds_domain::Result;
use uds_scheduler::job::Job;
use uds_store::Store;

/// Releases every `Assigned`, `Usable`, not-`in_use` row whose
/// `state_date` is older than `check_unused_time`. `check_unused_time ==
/// 0` disables the check, matching `PolicyConfig::check_unused_time`'s
/// documented "0 disables" convention (the same one `RESTRAINT_TIME`
/// uses, per §9's open question about that switch).
pub async fn reclaim_unused(store: &dyn Store, check_unused_time: Duration) -> Result<usize> {
    if check_unused_time.is_zero() {
        return Ok(0);
    }
    let cutoff = store.now() - check_unused_time;
    let mut reclaimed = 0usize;

    for pool in store.list_pools().await? {
        let rows = store.list_user_services_by_pool(pool.id).await?;
        for row in rows {
            if row.cache_level != CacheLevel::Assigned
                || row.state != UserServiceState::Usable
                || row.in_use
                || row.state_date > cutoff
            {
                continue;
            }
            uds_userservice::release(store, row.id).await?;
            reclaimed += 1;
        }
    }

    if reclaimed > 0 {
        debug!(reclaimed, "reclaimed idle assigned user services");
    }
    Ok(reclaimed)
}

/// [`Job`] wrapper driving [`reclaim_unused`]. Reuses
/// `CacheUpdaterConfig::cache_check_delay`'s tick cadence rather than
/// introducing a dedicated frequency key — the policy config carries
/// only the idle threshold, not its own poll interval.
pub struct ReclaimUnusedJob {
    store: Arc<dyn Store>,
    policy: PolicyConfig,
    frequency_seconds: u32,
}

impl ReclaimUnusedJob {
    pub fn new(store: Arc<dyn Store>, policy: PolicyConfig, frequency_seconds: u32) -> Self {
        Self {
            store,
            policy,
            frequency_seconds,
        }
    }
}

#[async_trait]
impl Job for ReclaimUnusedJob {
    fn name(&self) -> &str {
        "reclaim_unused_assignments"
    }

    fn friendly_name(&self) -> &str {
        "Idle Assignment Reclaim"
    }

    fn frequency_seconds(&self) -> u32 {
        self.frequency_seconds
    }

    async fn run(&self) -> Result<()> {
        reclaim_unused(
            self.store.as_ref(),
            Duration::seconds(self.policy.check_unused_time as i64),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uds_domain::entities::{
        AccessAction, MaxServicesCountType, OsState, Provider, Service, ServicePool,
        ServicePoolState, UserService,
    };
    use uds_domain::ids::{ProviderId, ServiceId, ServicePoolId, UserId, UserServiceId};
    use uds_store::MemoryStore;

    async fn seed_pool(store: &MemoryStore) -> ServicePool {
        let provider = store
            .save_provider(Provider {
                id: 0,
                uuid: ProviderId::new(),
                name: "p".into(),
                data_type: "test".into(),
                maintenance_mode: false,
                concurrent_creation_limit: 5,
                concurrent_removal_limit: 5,
            })
            .await
            .unwrap();
        let service = store
            .save_service(Service {
                id: 0,
                uuid: ServiceId::new(),
                provider_id: provider.uuid,
                name: "svc".into(),
                token: None,
                max_services_count_type: MaxServicesCountType::Absolute,
                max_services_count: 0,
                uses_cache: true,
                uses_cache_l2: false,
                needs_publication: false,
            })
            .await
            .unwrap();
        store
            .save_pool(ServicePool {
                id: 0,
                uuid: ServicePoolId::new(),
                name: "pool".into(),
                service_id: service.uuid,
                state: ServicePoolState::Active,
                initial_srvs: 0,
                cache_l1_srvs: 0,
                cache_l2_srvs: 0,
                max_srvs: 0,
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
                fallback_access: AccessAction::Allow,
            })
            .await
            .unwrap()
    }

    fn assigned_row(pool_id: ServicePoolId, in_use: bool, state_date: chrono::DateTime<Utc>) -> UserService {
        UserService {
            id: 0,
            uuid: UserServiceId::new(),
            pool_id,
            state: UserServiceState::Usable,
            os_state: OsState::Usable,
            cache_level: CacheLevel::Assigned,
            user_id: Some(UserId::new()),
            account_id: None,
            publication_id: None,
            publication_revision: None,
            unique_id: None,
            in_use,
            in_use_date: None,
            src_ip: None,
            src_hostname: None,
            creation_date: state_date,
            state_date,
            error_reason: None,
            to_be_replaced: false,
            destroy_after: false,
            data: vec![],
            properties: Default::default(),
        }
    }

    #[tokio::test]
    async fn idle_assignment_past_the_threshold_is_released() {
        let store = Arc::new(MemoryStore::new());
        let pool = seed_pool(&store).await;
        let stale = store
            .insert_user_service(assigned_row(pool.uuid, false, Utc::now() - Duration::hours(2)))
            .await
            .unwrap();

        let reclaimed = reclaim_unused(store.as_ref(), Duration::minutes(5)).await.unwrap();
        assert_eq!(reclaimed, 1);

        let after = store.get_user_service(stale.id).await.unwrap();
        assert_eq!(after.state, UserServiceState::Removable);
    }

    #[tokio::test]
    async fn an_in_use_assignment_is_never_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let pool = seed_pool(&store).await;
        let busy = store
            .insert_user_service(assigned_row(pool.uuid, true, Utc::now() - Duration::hours(2)))
            .await
            .unwrap();

        reclaim_unused(store.as_ref(), Duration::minutes(5)).await.unwrap();

        let after = store.get_user_service(busy.id).await.unwrap();
        assert_eq!(after.state, UserServiceState::Usable);
    }

    #[tokio::test]
    async fn zero_threshold_disables_the_check() {
        let store = Arc::new(MemoryStore::new());
        let pool = seed_pool(&store).await;
        store
            .insert_user_service(assigned_row(pool.uuid, false, Utc::now() - Duration::days(30)))
            .await
            .unwrap();

        let reclaimed = reclaim_unused(store.as_ref(), Duration::zero()).await.unwrap();
        assert_eq!(reclaimed, 0);
    }
}
