//! S2: a user request is served from an already-cached L1 instance
//! without ever calling the provider's `deploy_for_user`, and the pool
//! re-grows L1 back to its target on the next cache-updater tick.

use std::collections::HashMap;
use std::sync::Arc;

use uds_cache::job::CacheUpdaterJob;
use uds_domain::config::{CacheUpdaterConfig, RestraintConfig};
use uds_domain::entities::{
    CacheLevel, MaxServicesCountType, OsState, Provider, Service, ServicePool, ServicePoolState,
    UserService, UserServiceState,
};
use uds_domain::ids::{ProviderId, ServiceId, ServicePoolId, UserId, UserServiceId};
use uds_providers::{ProviderPlugin, TestProvider};
use uds_scheduler::job::Job;
use uds_service_manager::{GetServiceOutcome, ServiceManager};
use uds_store::{MemoryStore, Store};

fn pool(service_uuid: ServiceId) -> ServicePool {
    ServicePool {
        id: 0,
        uuid: ServicePoolId::new(),
        name: "assign-pool".into(),
        service_id: service_uuid,
        state: ServicePoolState::Active,
        initial_srvs: 1,
        cache_l1_srvs: 1,
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
    }
}

fn cached_l1(pool_uuid: ServicePoolId) -> UserService {
    let now = chrono::Utc::now();
    UserService {
        id: 0,
        uuid: UserServiceId::new(),
        pool_id: pool_uuid,
        state: UserServiceState::Usable,
        os_state: OsState::Usable,
        cache_level: CacheLevel::L1,
        user_id: None,
        account_id: None,
        publication_id: None,
        publication_revision: None,
        unique_id: None,
        in_use: false,
        in_use_date: None,
        src_ip: None,
        src_hostname: None,
        creation_date: now,
        state_date: now,
        error_reason: None,
        to_be_replaced: false,
        destroy_after: false,
        data: vec![],
        properties: Default::default(),
    }
}

#[tokio::test]
async fn assigning_from_l1_reuses_the_cached_row_then_the_tick_regrows_it() {
    let store = Arc::new(MemoryStore::new());
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
            max_services_count_type: MaxServicesCountType::Absolute,
            max_services_count: 0,
            uses_cache: true,
            uses_cache_l2: false,
            needs_publication: false,
        })
        .await
        .unwrap();
    let pool_row = store.save_pool(pool(service_row.uuid)).await.unwrap();
    let seeded = store.insert_user_service(cached_l1(pool_row.uuid)).await.unwrap();

    let test_provider = Arc::new(TestProvider::new());
    let mut providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>> = HashMap::new();
    providers.insert(provider_row.uuid, test_provider.clone());

    let manager = ServiceManager::new(store.clone(), providers.clone());
    let user = UserId::new();
    let outcome = manager
        .get_user_service(pool_row.uuid, user, &[])
        .await
        .unwrap();

    let assigned = match outcome {
        GetServiceOutcome::Ready(us) => us,
        GetServiceOutcome::Preparing(_) => panic!("expected the cached L1 row to be reused, not a fresh deploy"),
    };
    assert_eq!(assigned.id, seeded.id);
    assert_eq!(assigned.cache_level, CacheLevel::Assigned);
    assert_eq!(assigned.user_id, Some(user));

    let rows = store.list_user_services_by_pool(pool_row.id).await.unwrap();
    assert!(
        rows.iter().filter(|u| u.cache_level == CacheLevel::L1 && !u.is_terminal()).count() == 0,
        "the only L1 row should have been promoted to Assigned"
    );

    let job = CacheUpdaterJob::new(
        store.clone(),
        providers,
        CacheUpdaterConfig::default(),
        RestraintConfig::default(),
    );
    job.run().await.unwrap();
    let rows_after_tick = store.list_user_services_by_pool(pool_row.id).await.unwrap();
    let regrown = rows_after_tick
        .iter()
        .find(|u| u.cache_level == CacheLevel::L1 && !u.is_terminal())
        .expect("cache updater should have deployed a replacement L1 instance");
    assert_eq!(regrown.state, UserServiceState::Preparing);
}
