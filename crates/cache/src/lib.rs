//! Cache updater (§4.4): the periodic reconciliation loop that keeps
//! each active pool's L1/L2 cache and assigned count within its
//! configured targets, growing, shrinking, promoting, and demoting one
//! UserService at a time.

pub mod job;
pub mod reconcile;

pub use job::CacheUpdaterJob;
pub use reconcile::{reconcile_pool, Action, ReconcileCtx, SkipReason};

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use uds_domain::config::{CacheUpdaterConfig, RestraintConfig};
    use uds_domain::entities::{
        CacheLevel, MaxServicesCountType, OsState, Provider, Service, ServicePool,
        ServicePoolState, UserService, UserServiceState,
    };
    use uds_domain::ids::{ProviderId, ServiceId, ServicePoolId, UserServiceId};
    use uds_providers::TestProvider;
    use uds_store::{MemoryStore, Store};

    fn provider() -> Provider {
        Provider {
            id: 1,
            uuid: ProviderId::new(),
            name: "p1".into(),
            data_type: "test".into(),
            maintenance_mode: false,
            concurrent_creation_limit: 10,
            concurrent_removal_limit: 10,
        }
    }

    fn service(provider_uuid: ProviderId, uses_cache_l2: bool) -> Service {
        Service {
            id: 1,
            uuid: ServiceId::new(),
            provider_id: provider_uuid,
            name: "svc".into(),
            token: None,
            max_services_count_type: MaxServicesCountType::Absolute,
            max_services_count: 0,
            uses_cache: true,
            uses_cache_l2,
            needs_publication: false,
        }
    }

    fn pool(service_uuid: ServiceId, initial: u32, l1: u32, l2: u32, max: u32) -> ServicePool {
        ServicePool {
            id: 1,
            uuid: ServicePoolId::new(),
            name: "pool".into(),
            service_id: service_uuid,
            state: ServicePoolState::Active,
            initial_srvs: initial,
            cache_l1_srvs: l1,
            cache_l2_srvs: l2,
            max_srvs: max,
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
        }
    }

    fn cached(pool_uuid: ServicePoolId, level: CacheLevel, state: UserServiceState) -> UserService {
        UserService {
            id: 0,
            uuid: UserServiceId::new(),
            pool_id: pool_uuid,
            state,
            os_state: OsState::Usable,
            cache_level: level,
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
        }
    }

    #[tokio::test]
    async fn an_empty_pool_below_initial_grows_l1() {
        let prov = provider();
        let svc = service(prov.uuid, false);
        let p = pool(svc.uuid, 2, 2, 0, 5);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig::default();

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &[],
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert!(matches!(action, Action::GrewL1(_)));
    }

    #[tokio::test]
    async fn a_zero_max_srvs_pool_is_unbounded_and_still_grows_l1() {
        let prov = provider();
        let svc = service(prov.uuid, false);
        let p = pool(svc.uuid, 1, 1, 0, 0);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig::default();

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &[],
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert!(matches!(action, Action::GrewL1(_)));
    }

    #[tokio::test]
    async fn l1_reduction_demotes_the_oldest_idle_entry_not_the_newest() {
        let prov = provider();
        let svc = service(prov.uuid, true);
        let p = pool(svc.uuid, 0, 0, 1, 5);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        let older = store
            .insert_user_service({
                let mut u = cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Usable);
                u.creation_date = Utc::now() - chrono::Duration::minutes(10);
                u
            })
            .await
            .unwrap();
        let newer = store
            .insert_user_service(cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Usable))
            .await
            .unwrap();

        let rows = store.list_user_services_by_pool(saved_pool.id).await.unwrap();
        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig::default();

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &rows,
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert_eq!(action, Action::ReducedL1Demoted(older.id));
        assert_ne!(older.id, newer.id);

        let demoted = store.get_user_service(older.id).await.unwrap();
        assert_eq!(demoted.cache_level, CacheLevel::L2);
    }

    #[tokio::test]
    async fn a_pool_over_max_reduces_l1_by_destroying_the_newest() {
        let prov = provider();
        let svc = service(prov.uuid, false);
        let p = pool(svc.uuid, 0, 0, 0, 1);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        let older = store
            .insert_user_service({
                let mut u = cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Usable);
                u.creation_date = Utc::now() - chrono::Duration::minutes(10);
                u
            })
            .await
            .unwrap();
        let newer = store
            .insert_user_service(cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Usable))
            .await
            .unwrap();

        let rows = store.list_user_services_by_pool(saved_pool.id).await.unwrap();
        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig::default();

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &rows,
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert_eq!(action, Action::ReducedL1Destroyed(newer.id));
        assert_ne!(newer.id, older.id);

        // Marked destroy_after so a concurrent/next-tick reduction pass
        // does not pick the same (now Removable-but-still-L1) row again.
        let destroyed = store.get_user_service(newer.id).await.unwrap();
        assert!(destroyed.destroy_after);
    }

    #[tokio::test]
    async fn restrained_pool_is_skipped() {
        let prov = provider();
        let svc = service(prov.uuid, false);
        let p = pool(svc.uuid, 2, 2, 0, 5);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        let mut errored = cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Error);
        errored.state_date = Utc::now();
        store.insert_user_service(errored.clone()).await.unwrap();
        store.insert_user_service(errored.clone()).await.unwrap();
        store.insert_user_service(errored).await.unwrap();
        let rows = store.list_user_services_by_pool(saved_pool.id).await.unwrap();

        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig {
            restraint_time_secs: 3600,
            restraint_count: 3,
        };

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &rows,
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert_eq!(action, Action::Skipped(SkipReason::Restrained));
    }

    #[tokio::test]
    async fn l1_cache_promotes_an_idle_l2_entry_before_creating() {
        let prov = provider();
        let svc = service(prov.uuid, true);
        let p = pool(svc.uuid, 1, 1, 1, 3);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        let l2_entry = store
            .insert_user_service(cached(saved_pool.uuid, CacheLevel::L2, UserServiceState::Usable))
            .await
            .unwrap();
        let rows = store.list_user_services_by_pool(saved_pool.id).await.unwrap();

        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig::default();

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &rows,
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert_eq!(action, Action::PromotedL2ToL1(l2_entry.id));

        let promoted = store.get_user_service(l2_entry.id).await.unwrap();
        assert_eq!(promoted.cache_level, CacheLevel::L1);
    }

    fn needs_publication_service(provider_uuid: ProviderId) -> Service {
        Service {
            needs_publication: true,
            ..service(provider_uuid, false)
        }
    }

    #[tokio::test]
    async fn stale_revision_cache_entries_are_retired_when_a_new_publication_goes_usable() {
        let prov = provider();
        let svc = needs_publication_service(prov.uuid);
        let p = pool(svc.uuid, 0, 1, 0, 3);
        let store = MemoryStore::new();
        let saved_pool = store.save_pool(p).await.unwrap();

        store
            .save_publication(uds_domain::entities::Publication {
                id: 0,
                uuid: uds_domain::ids::PublicationId::new(),
                pool_id: saved_pool.uuid,
                state: uds_domain::entities::PublicationState::Usable,
                revision: 8,
                error_reason: None,
            })
            .await
            .unwrap();

        let stale_cached = store
            .insert_user_service(UserService {
                publication_revision: Some(7),
                ..cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Usable)
            })
            .await
            .unwrap();
        let stale_idle_assigned = store
            .insert_user_service(UserService {
                publication_revision: Some(7),
                cache_level: CacheLevel::Assigned,
                user_id: Some(uds_domain::ids::UserId::new()),
                in_use: false,
                ..cached(saved_pool.uuid, CacheLevel::Assigned, UserServiceState::Usable)
            })
            .await
            .unwrap();
        let stale_in_use_assigned = store
            .insert_user_service(UserService {
                publication_revision: Some(7),
                cache_level: CacheLevel::Assigned,
                user_id: Some(uds_domain::ids::UserId::new()),
                in_use: true,
                ..cached(saved_pool.uuid, CacheLevel::Assigned, UserServiceState::Usable)
            })
            .await
            .unwrap();
        let current_revision = store
            .insert_user_service(UserService {
                publication_revision: Some(8),
                ..cached(saved_pool.uuid, CacheLevel::L1, UserServiceState::Usable)
            })
            .await
            .unwrap();

        let rows = store.list_user_services_by_pool(saved_pool.id).await.unwrap();
        let test_provider = TestProvider::new();
        let cache_cfg = CacheUpdaterConfig::default();
        let restraint_cfg = RestraintConfig::default();

        let ctx = ReconcileCtx {
            store: &store,
            provider_plugin: &test_provider,
            pool: &saved_pool,
            service: &svc,
            provider: &prov,
            user_services: &rows,
            cache_cfg: &cache_cfg,
            restraint_cfg: &restraint_cfg,
            now: store.now(),
        };
        let action = reconcile_pool(ctx).await.unwrap();
        assert_eq!(action, Action::RetiredForReplacement(3));

        assert_eq!(
            store.get_user_service(stale_cached.id).await.unwrap().state,
            UserServiceState::Removable
        );
        assert_eq!(
            store.get_user_service(stale_idle_assigned.id).await.unwrap().state,
            UserServiceState::Removable
        );
        let in_use = store.get_user_service(stale_in_use_assigned.id).await.unwrap();
        assert_eq!(in_use.state, UserServiceState::Usable);
        assert!(in_use.to_be_replaced);
        assert_eq!(
            store.get_user_service(current_revision.id).await.unwrap().state,
            UserServiceState::Usable
        );
    }
}
