//! Assembles one [`Engine`] value from a loaded [`EngineConfig`]: the
//! concrete `Store`, the provider plug-in table, and every job the
//! scheduler run loop drives (§A "no global singletons" — everything
//! below is owned by this value, nothing is a `lazy_static`/`OnceCell`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use uds_allocator::UniqueIdAllocator;
use uds_cache::CacheUpdaterJob;
use uds_deferred_deletion::{DeferredDeletionJob, DeferredDeletionWorker, RemovalSweepJob};
use uds_domain::config::{EngineConfig, StoreBackend};
use uds_domain::ids::ProviderId;
use uds_providers::registry::ProviderRegistry as PluginFactories;
use uds_providers::{ProviderPlugin, TestProvider};
use uds_scheduler::registry::JobRegistry;
use uds_scheduler::runner::{SchedulerRunner, StopFlag};
use uds_service_manager::ServiceManager;
use uds_store::{MemoryStore, Store};

#[cfg(feature = "postgres")]
use uds_store::pg::PgStore;

use crate::clock_skew::ClockSkewJob;

/// Everything the `run`/`doctor` subcommands need, built once at
/// startup and handed around as `Arc`s from here on.
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub service_manager: Arc<ServiceManager>,
    pub providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
    pub allocator: UniqueIdAllocator,
    pub registry: Arc<JobRegistry>,
    pub runner: SchedulerRunner,
}

impl Engine {
    pub async fn bootstrap(config: &EngineConfig, hostname: impl Into<String>) -> anyhow::Result<Self> {
        let hostname = hostname.into();
        #[cfg(feature = "postgres")]
        let (store, pg_handle) = build_store(&config.store).await?;
        #[cfg(not(feature = "postgres"))]
        let store = build_store(&config.store).await?;
        let providers = build_providers(store.as_ref()).await?;
        if providers.is_empty() {
            warn!("no provider plug-in instances built; cache and deletion passes have nothing to reconcile yet");
        }

        let service_manager = Arc::new(ServiceManager::new(store.clone(), providers.clone()));
        let allocator = UniqueIdAllocator::new(store.clone());

        let mut registry = JobRegistry::new();
        registry.register(Arc::new(CacheUpdaterJob::new(
            store.clone(),
            providers.clone(),
            config.cache.clamped(),
            config.restraint.clamped(),
        )));
        let deferred_cfg = config.deferred_deletion.clamped();
        let check_interval_secs = deferred_cfg.check_interval_secs;
        let worker = Arc::new(DeferredDeletionWorker::new(store.clone(), providers.clone(), deferred_cfg));
        registry.register(Arc::new(DeferredDeletionJob::new(worker.clone(), check_interval_secs)));
        registry.register(Arc::new(RemovalSweepJob::new(
            store.clone(),
            providers.clone(),
            worker.clone(),
            check_interval_secs,
        )));
        registry.register(Arc::new(uds_userservice::CleanupJob::new(
            store.clone(),
            allocator.clone(),
            config.store.clamped(),
        )));
        registry.register(Arc::new(uds_service_manager::ReclaimUnusedJob::new(
            store.clone(),
            config.policy.clamped(),
            config.cache.clamped().cache_check_delay,
        )));

        #[cfg(feature = "postgres")]
        if let Some(pg) = pg_handle {
            registry.register(Arc::new(ClockSkewJob::new(pg)));
        }

        let registry = Arc::new(registry);
        registry
            .ensure_registered(store.as_ref())
            .await
            .context("registering scheduled jobs")?;

        let runner = SchedulerRunner::new(
            registry.clone(),
            store.clone(),
            hostname,
            config.scheduler.granularity_secs,
            config.scheduler.stuck_threshold_secs,
        );

        Ok(Self {
            store,
            service_manager,
            providers,
            allocator,
            registry,
            runner,
        })
    }

    /// Startup crash recovery, then the run loop, until `stop` is
    /// requested.
    pub async fn run(&self, stop: StopFlag) -> anyhow::Result<()> {
        let recovered = self.runner.recover().await.context("scheduler crash recovery")?;
        if recovered > 0 {
            info!(recovered, "recovered scheduler rows left by a prior run");
        }
        self.runner.run(stop).await;
        Ok(())
    }
}

/// Builds the configured backend. When the `postgres` feature is
/// compiled in, also hands back the concrete `PgStore` handle alongside
/// the trait object (`None` for the Memory backend) so the clock-skew
/// job can reach its inherent `refresh_clock_skew` method, which isn't
/// part of the `Store` port itself.
#[cfg(feature = "postgres")]
async fn build_store(
    cfg: &uds_domain::config::StoreConfig,
) -> anyhow::Result<(Arc<dyn Store>, Option<Arc<PgStore>>)> {
    match cfg.backend {
        StoreBackend::Memory => {
            let store = match &cfg.persist_path {
                Some(path) => MemoryStore::with_persist_path(path),
                None => MemoryStore::new(),
            };
            info!(persist_path = ?cfg.persist_path, "memory store ready");
            Ok((Arc::new(store), None))
        }
        StoreBackend::Postgres => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("store.database_url is required when store.backend = \"postgres\"")
            })?;
            let store = Arc::new(
                PgStore::connect(url, cfg.max_connections)
                    .await
                    .context("connecting to Postgres")?,
            );
            store.migrate().await.context("running Postgres migrations")?;
            info!(max_connections = cfg.max_connections, "postgres store ready");
            Ok((store.clone() as Arc<dyn Store>, Some(store)))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_store(cfg: &uds_domain::config::StoreConfig) -> anyhow::Result<Arc<dyn Store>> {
    match cfg.backend {
        StoreBackend::Memory => {
            let store = match &cfg.persist_path {
                Some(path) => MemoryStore::with_persist_path(path),
                None => MemoryStore::new(),
            };
            info!(persist_path = ?cfg.persist_path, "memory store ready");
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => anyhow::bail!(
            "store.backend = \"postgres\" but this binary was built without the `postgres` feature"
        ),
    }
}

/// Builds one long-lived plug-in instance per distinct provider the
/// catalog currently references, keyed by the provider's own uuid.
///
/// Only the `"test"` `data_type` has a concrete [`ProviderPlugin`]
/// implementation anywhere in this workspace — real backend adapters
/// (ovirt, openstack, ...) are the extension point a production
/// deployment fills in by registering more factories with
/// [`PluginFactories::register`] before calling this.
async fn build_providers(store: &dyn Store) -> anyhow::Result<HashMap<ProviderId, Arc<dyn ProviderPlugin>>> {
    let mut factories = PluginFactories::new();
    factories.register("test", |_cfg| Ok(Arc::new(TestProvider::new())));

    let mut providers = HashMap::new();
    let mut seen = HashSet::new();
    for pool in store.list_pools().await? {
        let service = store.get_service_by_uuid(pool.service_id).await?;
        if !seen.insert(service.provider_id) {
            continue;
        }
        let provider = store.get_provider_by_uuid(service.provider_id).await?;
        match factories.build(&provider.data_type, &serde_json::Value::Null) {
            Ok(plugin) => {
                providers.insert(provider.uuid, plugin);
            }
            Err(e) => warn!(
                provider = %provider.name,
                data_type = %provider.data_type,
                error = %e,
                "no plug-in implementation registered for this provider's data_type"
            ),
        }
    }
    Ok(providers)
}
