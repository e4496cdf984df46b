//! S3: once a pool's publication advances to a new revision, instances
//! still on the old one are retired — idle ones immediately, an in-use
//! one only once its session actually ends (§4.3/§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use uds_cache::job::CacheUpdaterJob;
use uds_domain::config::{CacheUpdaterConfig, RestraintConfig};
use uds_domain::entities::{
    CacheLevel, MaxServicesCountType, OsState, Provider, Publication, PublicationState, Service,
    ServicePool, ServicePoolState, UserService, UserServiceState,
};
use uds_domain::ids::{ProviderId, PublicationId, ServiceId, ServicePoolId, UserId, UserServiceId};
use uds_providers::{ProviderPlugin, TestProvider};
use uds_scheduler::job::Job;
use uds_service_manager::{AgentEvent, ServiceManager};
use uds_store::{MemoryStore, Store};

fn pool(service_uuid: ServiceId) -> ServicePool {
    ServicePool {
        id: 0,
        uuid: ServicePoolId::new(),
        name: "publish-pool".into(),
        service_id: service_uuid,
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
    }
}

fn assigned_on_revision(pool_uuid: ServicePoolId, revision: u32, in_use: bool) -> UserService {
    let now = chrono::Utc::now();
    UserService {
        id: 0,
        uuid: UserServiceId::new(),
        pool_id: pool_uuid,
        state: UserServiceState::Usable,
        os_state: OsState::Usable,
        cache_level: CacheLevel::Assigned,
        user_id: Some(UserId::new()),
        account_id: None,
        publication_id: None,
        publication_revision: Some(revision),
        unique_id: None,
        in_use,
        in_use_date: if in_use { Some(now) } else { None },
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
async fn an_in_use_stale_instance_drains_on_logout_instead_of_being_cut_off_mid_session() {
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
            needs_publication: true,
        })
        .await
        .unwrap();
    let pool_row = store.save_pool(pool(service_row.uuid)).await.unwrap();
    store
        .save_publication(Publication {
            id: 0,
            uuid: PublicationId::new(),
            pool_id: pool_row.uuid,
            state: PublicationState::Usable,
            revision: 2,
            error_reason: None,
        })
        .await
        .unwrap();

    let idle_stale = store
        .insert_user_service(assigned_on_revision(pool_row.uuid, 1, false))
        .await
        .unwrap();
    let in_use_stale = store
        .insert_user_service(assigned_on_revision(pool_row.uuid, 1, true))
        .await
        .unwrap();

    let test_provider: Arc<dyn ProviderPlugin> = Arc::new(TestProvider::new());
    let mut providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>> = HashMap::new();
    providers.insert(provider_row.uuid, test_provider);

    let job = CacheUpdaterJob::new(
        store.clone(),
        providers.clone(),
        CacheUpdaterConfig::default(),
        RestraintConfig::default(),
    );
    job.run().await.unwrap();

    // Idle stale row is released immediately; the in-use one keeps serving.
    assert_eq!(
        store.get_user_service(idle_stale.id).await.unwrap().state,
        UserServiceState::Removable
    );
    let still_serving = store.get_user_service(in_use_stale.id).await.unwrap();
    assert_eq!(still_serving.state, UserServiceState::Usable);
    assert!(still_serving.to_be_replaced);

    // Logout drains it: notify_event sees to_be_replaced and releases the row
    // instead of leaving a dead instance sitting around assigned forever.
    let manager = ServiceManager::new(store.clone(), providers);
    let server_token = in_use_stale.uuid.to_string();
    let after_logout = manager.notify_event(&server_token, AgentEvent::Logout).await.unwrap();
    assert_eq!(after_logout.state, UserServiceState::Removable);
    assert!(!after_logout.in_use);
}
