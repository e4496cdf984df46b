//! Per-UserService finite state machine (§4.3).
//!
//! Every transition here follows the same shape: read (or is handed) the
//! row, call at most one plug-in method, then write the result back
//! through [`Store::with_user_service_locked`] — never a plug-in call
//! while holding the row's lock (§5).

use chrono::Utc;

use uds_domain::entities::{CacheLevel, OsState, ServicePool, UserService, UserServiceState};
use uds_domain::ids::{InternalId, PublicationId, UserId, UserServiceId};
use uds_domain::{Error, Result, TaskState};
use uds_providers::ProviderPlugin;
use uds_store::Store;

/// Creates a new UserService row in `Preparing` and kicks off
/// provisioning for immediate assignment to `user_id`. Corresponds to
/// `deploy_for_user(U)`.
pub async fn deploy_for_user(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    pool: &ServicePool,
    publication: Option<(PublicationId, u32)>,
    user_id: UserId,
) -> Result<UserService> {
    let us = new_preparing_row(store, pool, publication, CacheLevel::Assigned, Some(user_id));
    let inserted = store.insert_user_service(us).await?;
    kick_off_deploy(store, provider, inserted, CacheLevel::Assigned).await
}

/// Creates a new UserService row in `Preparing` destined for the given
/// cache level rather than a specific user. Corresponds to
/// `deploy_for_cache(level)`.
pub async fn deploy_for_cache(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    pool: &ServicePool,
    publication: Option<(PublicationId, u32)>,
    level: CacheLevel,
) -> Result<UserService> {
    if level == CacheLevel::Assigned {
        return Err(Error::fatal("deploy_for_cache called with CacheLevel::Assigned"));
    }
    let us = new_preparing_row(store, pool, publication, level, None);
    let inserted = store.insert_user_service(us).await?;
    kick_off_deploy(store, provider, inserted, level).await
}

fn new_preparing_row(
    store: &dyn Store,
    pool: &ServicePool,
    publication: Option<(PublicationId, u32)>,
    cache_level: CacheLevel,
    user_id: Option<UserId>,
) -> UserService {
    let now = store.now();
    UserService {
        id: 0,
        uuid: UserServiceId::new(),
        pool_id: pool.uuid,
        state: UserServiceState::Preparing,
        os_state: OsState::Preparing,
        cache_level,
        user_id,
        account_id: None,
        publication_id: publication.map(|(id, _)| id),
        publication_revision: publication.map(|(_, rev)| rev),
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

async fn kick_off_deploy(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    us: UserService,
    level: CacheLevel,
) -> Result<UserService> {
    let outcome = if level == CacheLevel::Assigned {
        provider.deploy_for_user(&us).await
    } else {
        provider.deploy_for_cache(&us, level).await
    };
    match outcome {
        Ok(TaskState::Error(reason)) => {
            store
                .with_user_service_locked(us.id, move |mut row| async move {
                    row.state = UserServiceState::Error;
                    row.error_reason = Some(reason);
                    row.state_date = Utc::now();
                    Ok(row)
                })
                .await
        }
        Ok(_) => Ok(us),
        Err(e) => {
            store
                .with_user_service_locked(us.id, move |mut row| async move {
                    row.state = UserServiceState::Error;
                    row.error_reason = Some(e.to_string());
                    row.state_date = Utc::now();
                    Ok(row)
                })
                .await
        }
    }
}

/// One step of the scheduler's "check state" pass (§4.3) for a single
/// row. Advances `Preparing`/`Canceling` rows according to the plug-in's
/// `check_state()`/`cancel()` result; a no-op for any other state.
pub async fn check_state_once(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    id: InternalId,
) -> Result<UserService> {
    let current = store.get_user_service(id).await?;
    let outcome = match current.state {
        UserServiceState::Preparing => provider.check_state(&current).await?,
        UserServiceState::Canceling => provider.cancel(&current).await?,
        _ => return Ok(current),
    };

    store
        .with_user_service_locked(id, move |mut row| async move {
            let now = Utc::now();
            match (row.state, outcome) {
                (UserServiceState::Preparing, TaskState::Finished) => {
                    row.state = UserServiceState::Usable;
                    row.state_date = now;
                }
                (UserServiceState::Preparing, TaskState::Error(reason)) => {
                    row.state = UserServiceState::Error;
                    row.error_reason = Some(reason);
                    row.state_date = now;
                }
                (UserServiceState::Canceling, TaskState::Finished) => {
                    row.state = UserServiceState::Removable;
                    row.state_date = now;
                }
                // Running: no transition, try again next tick.
                _ => {}
            }
            Ok(row)
        })
        .await
}

/// OS-manager "ready" callback: sets `os_state = Usable` independently
/// of the engine-level state. Cache-level movement triggered by this
/// event is the cache updater's concern, not the FSM's.
pub async fn notify_ready_from_osmanager(store: &dyn Store, id: InternalId) -> Result<UserService> {
    store
        .with_user_service_locked(id, |mut row| async move {
            row.os_state = OsState::Usable;
            Ok(row)
        })
        .await
}

/// Assigns an L1-cached, USABLE instance to `user_id`: `cache_level :=
/// Assigned`, `user := Some(user_id)`, `state_date := now`.
pub async fn assign_to_user(
    store: &dyn Store,
    id: InternalId,
    user_id: UserId,
) -> Result<UserService> {
    store
        .with_user_service_locked(id, move |mut row| async move {
            if row.state != UserServiceState::Usable {
                return Err(Error::fatal(format!(
                    "cannot assign user service {} in state {:?}",
                    row.id, row.state
                )));
            }
            row.cache_level = CacheLevel::Assigned;
            row.user_id = Some(user_id);
            row.state_date = Utc::now();
            Ok(row)
        })
        .await
}

/// `set_in_use(true)`: records `in_use=true`, `in_use_date=now()`, and
/// opens an accounting row when `account_id` is set and no usage is
/// already open (idempotent: a second `set_in_use(true)` without an
/// intervening `false` must not open a second record).
pub async fn set_in_use_start(store: &dyn Store, id: InternalId) -> Result<UserService> {
    let now = store.now();
    let us = store
        .with_user_service_locked(id, move |mut row| async move {
            row.in_use = true;
            row.in_use_date = Some(now);
            row.state_date = now;
            Ok(row)
        })
        .await?;

    let Some((key, value)) = crate::accounting::open_if_needed(store, &us, now).await? else {
        return Ok(us);
    };
    store
        .with_user_service_locked(id, move |mut row| async move {
            row.set_property(key, value);
            Ok(row)
        })
        .await
}

/// `set_in_use(false)`: closes any open accounting row and clears
/// `in_use`. The FSM transition that follows (e.g. `release()`) is the
/// caller's responsibility — policy decides whether to tear the
/// instance down immediately or let it sit idle.
pub async fn set_in_use_end(store: &dyn Store, id: InternalId) -> Result<UserService> {
    let now = store.now();
    let us = store.get_user_service(id).await?;
    let closed_property = crate::accounting::close_if_open(store, &us, now).await?;
    store
        .with_user_service_locked(id, move |mut row| async move {
            row.in_use = false;
            row.state_date = now;
            if let Some(key) = closed_property {
                row.properties.remove(key);
            }
            Ok(row)
        })
        .await
}

/// `release()` / `remove()`: transitions a non-terminal row straight to
/// `Removable`. A UserService never skips `Removable` on its way to
/// `Removed` (§8 invariant 3) — this is the only place that sets it.
pub async fn release(store: &dyn Store, id: InternalId) -> Result<UserService> {
    store
        .with_user_service_locked(id, |mut row| async move {
            if row.state == UserServiceState::Removed {
                return Err(Error::fatal(format!(
                    "cannot release user service {} already removed",
                    row.id
                )));
            }
            row.state = UserServiceState::Removable;
            row.state_date = Utc::now();
            Ok(row)
        })
        .await
}

/// `cancel()` while `Preparing`: moves to `Canceling` and asks the
/// plug-in to abort. The check-state pass later advances `Canceling` to
/// `Removable` once `cancel()` reports `Finished`.
pub async fn cancel(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    id: InternalId,
) -> Result<UserService> {
    let current = store.get_user_service(id).await?;
    if current.state != UserServiceState::Preparing {
        return Err(Error::fatal(format!(
            "cannot cancel user service {} in state {:?}",
            current.id, current.state
        )));
    }
    let us = store
        .with_user_service_locked(id, |mut row| async move {
            row.state = UserServiceState::Canceling;
            row.state_date = Utc::now();
            Ok(row)
        })
        .await?;
    let _ = provider.cancel(&us).await?;
    Ok(us)
}

/// Scheduler sweep of a single REMOVABLE row (§4.3): asks the plug-in to
/// `destroy()` the backing resource and, once it reports `FINISHED`,
/// moves the row to REMOVED. A row whose provider requires a stop step
/// first (see [`uds_providers::ProviderPlugin::must_stop_before_deletion`])
/// is the deferred-deletion worker's concern, not this sweep's — callers
/// should route those rows there instead of calling this directly.
pub async fn destroy_once(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    id: InternalId,
) -> Result<UserService> {
    let current = store.get_user_service(id).await?;
    if current.state != UserServiceState::Removable {
        return Ok(current);
    }
    let outcome = provider.destroy(&current).await?;
    store
        .with_user_service_locked(id, move |mut row| async move {
            let now = Utc::now();
            match outcome {
                TaskState::Finished => {
                    row.state = UserServiceState::Removed;
                    row.state_date = now;
                }
                TaskState::Error(reason) => {
                    row.state = UserServiceState::Error;
                    row.error_reason = Some(reason);
                    row.state_date = now;
                }
                TaskState::Running => {}
            }
            Ok(row)
        })
        .await
}

/// Finalizes a REMOVABLE row as REMOVED without calling the provider's
/// `destroy()` again: used by the deferred-deletion worker once its own
/// queue walk already confirmed the backing resource is gone (§4.6), so
/// the FSM does not duplicate a plug-in call the worker already made.
pub async fn mark_removed(store: &dyn Store, id: InternalId) -> Result<UserService> {
    store
        .with_user_service_locked(id, |mut row| async move {
            row.state = UserServiceState::Removed;
            row.state_date = Utc::now();
            Ok(row)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use uds_domain::entities::ServicePoolState;
    use uds_domain::ids::ServicePoolId;
    use uds_providers::TestProvider;
    use uds_store::MemoryStore;

    fn pool() -> ServicePool {
        ServicePool {
            id: 1,
            uuid: ServicePoolId::new(),
            name: "pool".into(),
            service_id: uds_domain::ids::ServiceId::new(),
            state: ServicePoolState::Active,
            initial_srvs: 0,
            cache_l1_srvs: 2,
            cache_l2_srvs: 1,
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

    #[tokio::test]
    async fn deploy_for_cache_then_check_state_reaches_usable() {
        let store = MemoryStore::new();
        let provider = TestProvider::with_provisioning_ticks(1);
        let pool = pool();

        let us = deploy_for_cache(&store, &provider, &pool, None, CacheLevel::L1)
            .await
            .unwrap();
        assert_eq!(us.state, UserServiceState::Preparing);

        let after_first_poll = check_state_once(&store, &provider, us.id).await.unwrap();
        assert_eq!(after_first_poll.state, UserServiceState::Preparing);

        let after_second_poll = check_state_once(&store, &provider, us.id).await.unwrap();
        assert_eq!(after_second_poll.state, UserServiceState::Usable);
    }

    #[tokio::test]
    async fn assign_to_user_flips_cache_level_and_sets_owner() {
        let store = MemoryStore::new();
        let provider = TestProvider::new();
        let pool = pool();

        let us = deploy_for_cache(&store, &provider, &pool, None, CacheLevel::L1)
            .await
            .unwrap();
        check_state_once(&store, &provider, us.id).await.unwrap();

        let user = UserId::new();
        let assigned = assign_to_user(&store, us.id, user).await.unwrap();
        assert_eq!(assigned.cache_level, CacheLevel::Assigned);
        assert_eq!(assigned.user_id, Some(user));
        assert!(assigned.invariant_holds());
    }

    #[tokio::test]
    async fn release_never_skips_removable() {
        let store = MemoryStore::new();
        let provider = TestProvider::new();
        let pool = pool();

        let us = deploy_for_user(&store, &provider, &pool, None, UserId::new())
            .await
            .unwrap();
        check_state_once(&store, &provider, us.id).await.unwrap();

        let released = release(&store, us.id).await.unwrap();
        assert_eq!(released.state, UserServiceState::Removable);
    }

    #[tokio::test]
    async fn destroy_once_moves_a_removable_row_to_removed() {
        let store = MemoryStore::new();
        let provider = TestProvider::new();
        let pool = pool();

        let us = deploy_for_user(&store, &provider, &pool, None, UserId::new())
            .await
            .unwrap();
        check_state_once(&store, &provider, us.id).await.unwrap();
        release(&store, us.id).await.unwrap();

        let destroyed = destroy_once(&store, &provider, us.id).await.unwrap();
        assert_eq!(destroyed.state, UserServiceState::Removed);
        assert!(destroyed.is_terminal());
    }

    #[tokio::test]
    async fn destroy_once_is_a_no_op_outside_removable() {
        let store = MemoryStore::new();
        let provider = TestProvider::new();
        let pool = pool();

        let us = deploy_for_user(&store, &provider, &pool, None, UserId::new())
            .await
            .unwrap();
        let unchanged = destroy_once(&store, &provider, us.id).await.unwrap();
        assert_eq!(unchanged.state, UserServiceState::Preparing);
    }

    #[tokio::test]
    async fn cancel_only_allowed_while_preparing() {
        let store = MemoryStore::new();
        let provider = TestProvider::with_provisioning_ticks(5);
        let pool = pool();

        let us = deploy_for_cache(&store, &provider, &pool, None, CacheLevel::L2)
            .await
            .unwrap();
        let canceling = cancel(&store, &provider, us.id).await.unwrap();
        assert_eq!(canceling.state, UserServiceState::Canceling);

        let err = cancel(&store, &provider, us.id).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn deploy_error_from_plugin_lands_the_row_in_error_state() {
        let store = MemoryStore::new();
        struct AlwaysErrors;
        #[async_trait::async_trait]
        impl ProviderPlugin for AlwaysErrors {
            fn data_type(&self) -> &str {
                "always-errors"
            }
            async fn is_available(&self) -> Result<bool> {
                Ok(true)
            }
            async fn test_connection(&self) -> Result<uds_providers::ConnectionCheck> {
                Ok(uds_providers::ConnectionCheck { ok: true, error: None })
            }
            async fn list_resources(&self) -> Result<Vec<String>> {
                Ok(vec![])
            }
            async fn deploy_for_user(&self, _us: &UserService) -> Result<TaskState> {
                Ok(TaskState::Error("backend out of capacity".into()))
            }
            async fn deploy_for_cache(&self, _us: &UserService, _level: CacheLevel) -> Result<TaskState> {
                Ok(TaskState::Error("backend out of capacity".into()))
            }
            async fn check_state(&self, _us: &UserService) -> Result<TaskState> {
                unreachable!()
            }
            async fn cancel(&self, _us: &UserService) -> Result<TaskState> {
                unreachable!()
            }
            async fn destroy(&self, _us: &UserService) -> Result<TaskState> {
                unreachable!()
            }
            async fn is_running(&self, _us: &UserService) -> Result<bool> {
                unreachable!()
            }
            async fn stop(&self, _us: &UserService) -> Result<TaskState> {
                unreachable!()
            }
            async fn set_ready(&self, _us: &UserService) -> Result<TaskState> {
                unreachable!()
            }
            async fn user_logged_in(&self, _us: &UserService, _u: &str) -> Result<()> {
                Ok(())
            }
            async fn user_logged_out(&self, _us: &UserService, _u: &str) -> Result<()> {
                Ok(())
            }
            fn error_reason(&self, _us: &UserService) -> Option<String> {
                None
            }
            async fn get_ip(&self, _us: &UserService) -> Result<Option<String>> {
                Ok(None)
            }
            async fn get_unique_id(&self, _us: &UserService) -> Result<Option<String>> {
                Ok(None)
            }
            fn get_name(&self, _us: &UserService) -> String {
                "x".into()
            }
        }

        let pool = pool();
        let us = deploy_for_user(&store, &AlwaysErrors, &pool, None, UserId::new())
            .await
            .unwrap();
        assert_eq!(us.state, UserServiceState::Error);
        assert_eq!(us.error_reason.as_deref(), Some("backend out of capacity"));
    }
}
