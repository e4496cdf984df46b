//! The service manager façade (§4.7): the single entry point REST
//! handlers and OS-manager callbacks go through to get a usable
//! UserService, report readiness, or surface a login/logout event.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use uds_domain::entities::{CacheLevel, ServicePool, UserService, UserServiceState};
use uds_domain::ids::{GroupId, InternalId, ProviderId, ServicePoolId, UserId, UserServiceId};
use uds_domain::{Error, Result};
use uds_providers::ProviderPlugin;
use uds_store::Store;

use crate::access::is_access_allowed;

/// Outcome of [`ServiceManager::get_user_service`]: either a UserService
/// ready to hand to the caller, or one just created and still
/// `Preparing` — the caller is expected to poll again shortly.
#[derive(Debug, Clone)]
pub enum GetServiceOutcome {
    Ready(UserService),
    Preparing(UserService),
}

/// An agent-reported lifecycle event, surfaced through
/// [`ServiceManager::notify_event`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Login { username: String },
    Logout,
    Log { level: String, message: String },
}

/// Owns one already-constructed plug-in instance per provider, same as
/// [`uds_cache::CacheUpdaterJob`] and
/// [`uds_deferred_deletion::DeferredDeletionWorker`].
pub struct ServiceManager {
    store: Arc<dyn Store>,
    providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>,
}

impl ServiceManager {
    pub fn new(store: Arc<dyn Store>, providers: HashMap<ProviderId, Arc<dyn ProviderPlugin>>) -> Self {
        Self { store, providers }
    }

    async fn plugin_for_pool(&self, pool: &ServicePool) -> Result<Arc<dyn ProviderPlugin>> {
        let service = self.store.get_service_by_uuid(pool.service_id).await?;
        let provider = self.store.get_provider_by_uuid(service.provider_id).await?;
        self.providers.get(&provider.uuid).cloned().ok_or_else(|| {
            Error::fatal(format!("no plug-in instance registered for provider '{}'", provider.name))
        })
    }

    /// `get_user_service(user, pool)` (§4.7). `user_groups` is supplied
    /// by the caller rather than looked up here: the core models only a
    /// User/Group abstraction, not a directory, so group membership is
    /// resolved by whatever authenticates the caller upstream.
    pub async fn get_user_service(
        &self,
        pool_uuid: ServicePoolId,
        user_id: UserId,
        user_groups: &[GroupId],
    ) -> Result<GetServiceOutcome> {
        let pool = self.store.get_pool_by_uuid(pool_uuid).await?;
        if !pool.is_active() {
            return Err(Error::InvalidService(format!("pool '{}' is not active", pool.name)));
        }
        if !pool.assigned_groups.is_empty()
            && !user_groups.iter().any(|g| pool.assigned_groups.contains(g))
        {
            return Err(Error::InvalidService(format!(
                "user is not a member of any group assigned to pool '{}'",
                pool.name
            )));
        }
        if is_access_allowed(&pool, self.store.now()) == uds_domain::entities::AccessAction::Deny {
            return Err(Error::AccessDeniedByCalendar(format!(
                "pool '{}' is outside its allowed calendar",
                pool.name
            )));
        }

        let service = self.store.get_service_by_uuid(pool.service_id).await?;
        if service.needs_publication {
            let publication = self
                .store
                .active_publication(pool.id)
                .await?
                .ok_or_else(|| Error::InvalidService(format!("pool '{}' has no active publication", pool.name)))?;
            if !publication.is_usable() {
                return Err(Error::InvalidService(format!(
                    "pool '{}' publication is not usable yet",
                    pool.name
                )));
            }
        }

        let rows = self.store.list_user_services_by_pool(pool.id).await?;

        if let Some(existing) = rows
            .iter()
            .find(|u| u.user_id == Some(user_id) && !u.is_terminal())
        {
            debug!(pool = %pool.name, user = %user_id, "reusing already-assigned user service");
            return Ok(GetServiceOutcome::Ready(existing.clone()));
        }

        if let Some(candidate) = rows
            .iter()
            .filter(|u| u.cache_level == CacheLevel::L1 && u.state == UserServiceState::Usable && u.user_id.is_none())
            .min_by_key(|u| u.creation_date)
        {
            info!(pool = %pool.name, user = %user_id, "promoting cached instance to user");
            let assigned = uds_userservice::assign_to_user(self.store.as_ref(), candidate.id, user_id).await?;
            return Ok(GetServiceOutcome::Ready(assigned));
        }

        let active_count = rows.iter().filter(|u| !u.is_terminal()).count() as u32;
        if pool.max_srvs == 0 || active_count < pool.max_srvs {
            let plugin = self.plugin_for_pool(&pool).await?;
            let publication = if service.needs_publication {
                self.store
                    .active_publication(pool.id)
                    .await?
                    .map(|p| (p.uuid, p.revision))
            } else {
                None
            };
            info!(pool = %pool.name, user = %user_id, "no cached instance available, deploying one for this user");
            let created =
                uds_userservice::deploy_for_user(self.store.as_ref(), plugin.as_ref(), &pool, publication, user_id)
                    .await?;
            return Ok(GetServiceOutcome::Preparing(created));
        }

        Err(Error::MaxServicesReached {
            pool: pool.name.clone(),
            max: pool.max_srvs,
        })
    }

    /// `notify_ready_from_osmanager(userservice, data)`: advances
    /// `os_state` to `Usable` and, if the OS manager attached a payload,
    /// stores it in the row's opaque `data` field. Whether this frees the
    /// instance into a cache level or hands it to a waiting user is the
    /// cache updater's concern (§4.4), not this call's.
    pub async fn notify_ready_from_osmanager(
        &self,
        id: InternalId,
        data: Option<Vec<u8>>,
    ) -> Result<UserService> {
        let us = uds_userservice::notify_ready_from_osmanager(self.store.as_ref(), id).await?;
        let Some(data) = data else { return Ok(us) };
        self.store
            .with_user_service_locked(id, move |mut row| async move {
                row.data = data;
                Ok(row)
            })
            .await
    }

    /// `notify_event(server_token, event, data)`: agents identify
    /// themselves by the UserService's own opaque uuid (the same token
    /// already used as the unique-id allocator's `owner` column), since
    /// the core exposes no separate server/agent identity of its own.
    pub async fn notify_event(&self, server_token: &str, event: AgentEvent) -> Result<UserService> {
        let uuid: uuid::Uuid = server_token
            .parse()
            .map_err(|_| Error::InvalidService(format!("malformed server token '{server_token}'")))?;
        let us = self.store.get_user_service_by_uuid(UserServiceId(uuid)).await?;

        match event {
            AgentEvent::Login { username } => {
                debug!(user_service = %us.uuid, %username, "agent reported login");
                uds_userservice::set_in_use_start(self.store.as_ref(), us.id).await
            }
            AgentEvent::Logout => {
                debug!(user_service = %us.uuid, "agent reported logout");
                let after = uds_userservice::set_in_use_end(self.store.as_ref(), us.id).await?;
                if after.to_be_replaced && !after.is_terminal() {
                    info!(
                        user_service = %after.uuid,
                        "releasing stale instance on logout (drained after publication replacement)"
                    );
                    uds_userservice::release(self.store.as_ref(), after.id).await
                } else {
                    Ok(after)
                }
            }
            AgentEvent::Log { level, message } => {
                debug!(user_service = %us.uuid, %level, %message, "agent log event");
                self.store
                    .with_user_service_locked(us.id, move |mut row| async move {
                        row.set_property("last_log_level", level);
                        row.set_property("last_log_message", message);
                        Ok(row)
                    })
                    .await
            }
        }
    }
}
