//! [`Job`] wrapper that drives [`crate::reconcile::reconcile_pool`] across
//! every pool once per scheduler tick.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use uds_domain::config::{CacheUpdaterConfig, RestraintConfig};
use uds_domain::ids::ProviderId;
use uds_domain::Result;
use uds_providers::ProviderPlugin;
use uds_scheduler::job::Job;
use uds_store::Store;

use crate::reconcile::{reconcile_pool, Action, ReconcileCtx, SkipReason};

/// Periodic reconciliation job (§4.4). Holds one already-constructed
/// plug-in instance per provider — built once at startup by whatever
/// wires the engine together, not re-created per tick, so adapters with
/// in-memory state (connection pools, rate limiters) survive across runs.
pub struct CacheUpdaterJob {
    store: Arc<dyn Store>,
    providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
    cache_cfg: CacheUpdaterConfig,
    restraint_cfg: RestraintConfig,
}

impl CacheUpdaterJob {
    pub fn new(
        store: Arc<dyn Store>,
        providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
        cache_cfg: CacheUpdaterConfig,
        restraint_cfg: RestraintConfig,
    ) -> Self {
        Self {
            store,
            providers,
            cache_cfg,
            restraint_cfg,
        }
    }
}

#[async_trait]
impl Job for CacheUpdaterJob {
    fn name(&self) -> &str {
        "cache_updater"
    }

    fn friendly_name(&self) -> &str {
        "Service Cache Updater"
    }

    fn frequency_seconds(&self) -> u32 {
        self.cache_cfg.cache_check_delay
    }

    async fn run(&self) -> Result<()> {
        debug!("starting cache checking");
        let now = self.store.now();
        let pools = self.store.list_pools().await?;

        for pool in pools {
            let service = self.store.get_service_by_uuid(pool.service_id).await?;
            let provider = self.store.get_provider_by_uuid(service.provider_id).await?;
            let Some(plugin) = self.providers.get(&provider.uuid) else {
                warn!(provider = %provider.name, "no plug-in instance registered for provider, skipping pool");
                continue;
            };
            let user_services = self.store.list_user_services_by_pool(pool.id).await?;

            let ctx = ReconcileCtx {
                store: self.store.as_ref(),
                provider_plugin: plugin.as_ref(),
                pool: &pool,
                service: &service,
                provider: &provider,
                user_services: &user_services,
                cache_cfg: &self.cache_cfg,
                restraint_cfg: &self.restraint_cfg,
                now,
            };

            match reconcile_pool(ctx).await {
                Ok(Action::Skipped(SkipReason::Restrained)) => {
                    warn!(pool = %pool.name, "pool restrained due to excessive errors");
                }
                Ok(action) => {
                    debug!(pool = %pool.name, ?action, "cache reconciliation tick");
                }
                Err(e) => {
                    warn!(pool = %pool.name, error = %e, "cache reconciliation failed for pool");
                }
            }
        }

        Ok(())
    }
}
