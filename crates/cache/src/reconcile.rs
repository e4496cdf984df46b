//! Per-pool reconciliation (§4.4): the priority-ordered decision of
//! whether a pool needs to shrink, grow, or sit still this tick.
//!
//! Grounded directly on the upstream broker's cache updater: the skip
//! predicates, the reduce-before-grow ordering, and the
//! promote-L2-before-create / demote-before-destroy sub-policies all
//! mirror `ServiceCacheUpdater.servicesPoolsNeedingCacheUpdate` and its
//! `grow*Cache`/`reduce*Cache` helpers. Stale-publication retirement
//! mirrors the same updater's handling once a pool's publication
//! finishes: cached instances on an old revision are retired outright,
//! in-use assigned ones are flagged and left to drain.

use chrono::{DateTime, Utc};

use uds_domain::config::{CacheUpdaterConfig, RestraintConfig};
use uds_domain::entities::{
    CacheLevel, OsState, Provider, Service, ServicePool, UserService, UserServiceState,
};
use uds_domain::ids::InternalId;
use uds_domain::Result;
use uds_providers::ProviderPlugin;
use uds_store::Store;

/// Why a pool was left untouched this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotActive,
    NoCache,
    ProviderMaintenance,
    Restrained,
    NeedsPublication,
    PublicationPreparing,
    CannotGrow,
    MaxServicesReached,
}

/// The single action taken (or not taken) for a pool this tick. At most
/// one of these is ever returned per call, matching the "at most one
/// reconciliation action per pool per tick" ordering guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skipped(SkipReason),
    ReducedL1Destroyed(InternalId),
    ReducedL1Demoted(InternalId),
    ReducedL2Destroyed(InternalId),
    GrewL1(InternalId),
    GrewL2(InternalId),
    PromotedL2ToL1(InternalId),
    DeferredCreationLimit,
    DeferredRemovalLimit,
    NoActionNeeded,
    /// Reduction wanted to act but every candidate was `destroy_after`
    /// (L1) or there was nothing left (L2); nothing to do this tick.
    NothingToReduce,
    /// The active publication advanced past one or more instances'
    /// revision; that many rows were retired or marked `to_be_replaced`
    /// this tick (see [`retire_stale_publications`]).
    RetiredForReplacement(u32),
}

pub struct ReconcileCtx<'a> {
    pub store: &'a dyn Store,
    pub provider_plugin: &'a dyn ProviderPlugin,
    pub pool: &'a ServicePool,
    pub service: &'a Service,
    pub provider: &'a Provider,
    pub user_services: &'a [UserService],
    pub cache_cfg: &'a CacheUpdaterConfig,
    pub restraint_cfg: &'a RestraintConfig,
    pub now: DateTime<Utc>,
}

fn non_terminal(rows: &[UserService], level: CacheLevel) -> Vec<&UserService> {
    rows.iter()
        .filter(|u| u.cache_level == level && !u.is_terminal())
        .collect()
}

fn needs_os_manager(pool: &ServicePool) -> bool {
    pool.osmanager_id.is_some()
}

/// Whether an L2 entry is a valid promotion/demotion candidate given the
/// pool's OS-manager requirement: if the pool needs one, only entries
/// that are not yet fully USABLE end-to-end (or are already OS-ready)
/// qualify, mirroring `needsOsManager()`'s `State.isUsable` check.
fn is_promotable(us: &UserService, pool: &ServicePool) -> bool {
    if needs_os_manager(pool) {
        !matches!(us.state, UserServiceState::Usable) || matches!(us.os_state, OsState::Usable)
    } else {
        true
    }
}

async fn remove_or_cancel(
    store: &dyn Store,
    provider: &dyn ProviderPlugin,
    us: &UserService,
) -> Result<UserService> {
    if us.state == UserServiceState::Preparing {
        uds_userservice::cancel(store, provider, us.id).await
    } else {
        uds_userservice::release(store, us.id).await
    }
}

async fn move_cache_level(
    store: &dyn Store,
    id: InternalId,
    level: CacheLevel,
) -> Result<UserService> {
    store
        .with_user_service_locked(id, move |mut row| async move {
            row.cache_level = level;
            row.state_date = Utc::now();
            Ok(row)
        })
        .await
}

fn creating_count(rows: &[UserService]) -> u32 {
    rows.iter()
        .filter(|u| u.state == UserServiceState::Preparing)
        .count() as u32
}

fn removing_count(rows: &[UserService]) -> u32 {
    rows.iter()
        .filter(|u| matches!(u.state, UserServiceState::Removable | UserServiceState::Canceling))
        .count() as u32
}

async fn mark_destroy_after(store: &dyn Store, id: InternalId) -> Result<UserService> {
    store
        .with_user_service_locked(id, |mut row| async move {
            row.destroy_after = true;
            Ok(row)
        })
        .await
}

async fn reduce_l1<'a>(ctx: &ReconcileCtx<'a>, l1: &[&UserService], l2_count: u32) -> Result<Action> {
    if !ctx.cache_cfg.ignore_limits
        && removing_count(ctx.user_services) >= ctx.provider.concurrent_removal_limit
    {
        return Ok(Action::DeferredRemovalLimit);
    }

    let mut candidates: Vec<&UserService> = l1.iter().copied().filter(|u| !u.destroy_after).collect();
    // Newest first: destruction picks the newest, but demotion below scans
    // this same vector in reverse to reach the oldest first.
    candidates.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));

    if candidates.is_empty() {
        return Ok(Action::NothingToReduce);
    }

    if l2_count < ctx.pool.cache_l2_srvs {
        if let Some(valid) = candidates.iter().rev().find(|u| is_promotable(u, ctx.pool)) {
            let id = valid.id;
            move_cache_level(ctx.store, id, CacheLevel::L2).await?;
            return Ok(Action::ReducedL1Demoted(id));
        }
    }

    let target = candidates[0];
    let id = target.id;
    mark_destroy_after(ctx.store, id).await?;
    remove_or_cancel(ctx.store, ctx.provider_plugin, target).await?;
    Ok(Action::ReducedL1Destroyed(id))
}

async fn reduce_l2<'a>(ctx: &ReconcileCtx<'a>, l2: &[&UserService]) -> Result<Action> {
    if !ctx.cache_cfg.ignore_limits
        && removing_count(ctx.user_services) >= ctx.provider.concurrent_removal_limit
    {
        return Ok(Action::DeferredRemovalLimit);
    }
    let mut candidates: Vec<&UserService> = l2.to_vec();
    candidates.sort_by_key(|u| u.creation_date);
    let Some(oldest) = candidates.first() else {
        return Ok(Action::NothingToReduce);
    };
    let id = oldest.id;
    remove_or_cancel(ctx.store, ctx.provider_plugin, oldest).await?;
    Ok(Action::ReducedL2Destroyed(id))
}

async fn grow_l1<'a>(ctx: &ReconcileCtx<'a>, l2: &[&UserService]) -> Result<Action> {
    let mut candidates: Vec<&UserService> = l2.to_vec();
    candidates.sort_by_key(|u| u.creation_date);
    if let Some(valid) = candidates.iter().find(|u| is_promotable(u, ctx.pool)) {
        let id = valid.id;
        move_cache_level(ctx.store, id, CacheLevel::L1).await?;
        return Ok(Action::PromotedL2ToL1(id));
    }

    if !ctx.cache_cfg.ignore_limits
        && creating_count(ctx.user_services) >= ctx.provider.concurrent_creation_limit
    {
        return Ok(Action::DeferredCreationLimit);
    }

    let publication = active_publication_ref(ctx).await?;
    let us = uds_userservice::deploy_for_cache(
        ctx.store,
        ctx.provider_plugin,
        ctx.pool,
        publication,
        CacheLevel::L1,
    )
    .await?;
    Ok(Action::GrewL1(us.id))
}

async fn grow_l2<'a>(ctx: &ReconcileCtx<'a>) -> Result<Action> {
    if !ctx.cache_cfg.ignore_limits
        && creating_count(ctx.user_services) >= ctx.provider.concurrent_creation_limit
    {
        return Ok(Action::DeferredCreationLimit);
    }
    let publication = active_publication_ref(ctx).await?;
    let us = uds_userservice::deploy_for_cache(
        ctx.store,
        ctx.provider_plugin,
        ctx.pool,
        publication,
        CacheLevel::L2,
    )
    .await?;
    Ok(Action::GrewL2(us.id))
}

async fn active_publication_ref(
    ctx: &ReconcileCtx<'_>,
) -> Result<Option<(uds_domain::ids::PublicationId, u32)>> {
    if !ctx.service.needs_publication {
        return Ok(None);
    }
    let active = ctx.store.active_publication(ctx.pool.id).await?;
    Ok(active.map(|p| (p.uuid, p.revision)))
}

async fn mark_to_be_replaced(store: &dyn Store, id: InternalId) -> Result<UserService> {
    store
        .with_user_service_locked(id, |mut row| async move {
            row.to_be_replaced = true;
            Ok(row)
        })
        .await
}

/// Retires instances deployed from a stale publication revision once a
/// newer one goes USABLE: cached (non-assigned) instances and idle
/// assigned instances go straight to REMOVABLE; an assigned instance
/// still `in_use` keeps serving its session but is flagged
/// `to_be_replaced` so it does not survive the next logout.
async fn retire_stale_publications(ctx: &ReconcileCtx<'_>) -> Result<Option<Action>> {
    if !ctx.service.needs_publication {
        return Ok(None);
    }
    let Some(active) = ctx.store.active_publication(ctx.pool.id).await? else {
        return Ok(None);
    };

    let mut retired = 0u32;
    for us in ctx.user_services {
        if us.is_terminal() || us.state == UserServiceState::Removable {
            continue;
        }
        let Some(revision) = us.publication_revision else {
            continue;
        };
        if revision == active.revision {
            continue;
        }
        if us.cache_level == CacheLevel::Assigned && us.in_use {
            if !us.to_be_replaced {
                mark_to_be_replaced(ctx.store, us.id).await?;
                retired += 1;
            }
        } else {
            uds_userservice::release(ctx.store, us.id).await?;
            retired += 1;
        }
    }

    if retired > 0 {
        Ok(Some(Action::RetiredForReplacement(retired)))
    } else {
        Ok(None)
    }
}

/// Runs the §4.4 decision for one pool and carries out whatever action
/// the priority order selects. Returns the action taken (or the reason
/// nothing was) so the job can log and the tests can assert on it.
pub async fn reconcile_pool(ctx: ReconcileCtx<'_>) -> Result<Action> {
    if !ctx.pool.is_active() {
        return Ok(Action::Skipped(SkipReason::NotActive));
    }
    if !ctx.service.uses_cache {
        return Ok(Action::Skipped(SkipReason::NoCache));
    }
    if ctx.provider.maintenance_mode {
        return Ok(Action::Skipped(SkipReason::ProviderMaintenance));
    }

    if !ctx.restraint_cfg.is_disabled() {
        let window_start =
            ctx.now - chrono::Duration::seconds(ctx.restraint_cfg.restraint_time_secs as i64);
        let error_count = ctx
            .user_services
            .iter()
            .filter(|u| u.state == UserServiceState::Error && u.state_date > window_start)
            .count() as u32;
        if error_count >= ctx.restraint_cfg.restraint_count {
            return Ok(Action::Skipped(SkipReason::Restrained));
        }
    }

    if ctx.service.needs_publication {
        let active = ctx.store.active_publication(ctx.pool.id).await?;
        if active.is_none() {
            return Ok(Action::Skipped(SkipReason::NeedsPublication));
        }
    }
    let publications = ctx.store.list_publications(ctx.pool.id).await?;
    if publications.iter().any(|p| p.is_preparing()) {
        return Ok(Action::Skipped(SkipReason::PublicationPreparing));
    }

    if let Some(action) = retire_stale_publications(&ctx).await? {
        return Ok(action);
    }

    let l1 = non_terminal(ctx.user_services, CacheLevel::L1);
    let l2 = if ctx.service.uses_cache_l2 {
        non_terminal(ctx.user_services, CacheLevel::L2)
    } else {
        Vec::new()
    };
    let assigned = non_terminal(ctx.user_services, CacheLevel::Assigned);
    let total_l1_assigned = l1.len() as u32 + assigned.len() as u32;

    // max_srvs == 0 means "unbounded" (§3's invariant only binds
    // initial_srvs <= max_srvs "when max_srvs > 0"), so the hard-cap
    // checks below never fire for an unbounded pool.
    let has_hard_cap = ctx.pool.max_srvs > 0;

    // 1: over the hard cap.
    if has_hard_cap && total_l1_assigned > ctx.pool.max_srvs {
        return reduce_l1(&ctx, &l1, l2.len() as u32).await;
    }
    // 2: over the soft L1 target while above the initial floor.
    if total_l1_assigned > ctx.pool.initial_srvs && l1.len() as u32 > ctx.pool.cache_l1_srvs {
        return reduce_l1(&ctx, &l1, l2.len() as u32).await;
    }
    // 3: L2 oversized.
    if l2.len() as u32 > ctx.pool.cache_l2_srvs {
        return reduce_l2(&ctx, &l2).await;
    }

    // 4: growth gate.
    if !ctx.provider.can_grow() {
        return Ok(Action::Skipped(SkipReason::CannotGrow));
    }
    if ctx.service.max_services_count > 0 {
        let in_service = ctx
            .user_services
            .iter()
            .filter(|u| !u.is_terminal())
            .count() as u32;
        if in_service >= ctx.service.max_services_count {
            return Ok(Action::Skipped(SkipReason::MaxServicesReached));
        }
    }

    // 5: grow L2 before L1 — it sits outside max_srvs/initial_srvs.
    if l2.len() as u32 < ctx.pool.cache_l2_srvs {
        return grow_l2(&ctx).await;
    }
    // 6: already exactly at the hard cap, nothing left to do.
    if has_hard_cap && total_l1_assigned == ctx.pool.max_srvs {
        return Ok(Action::NoActionNeeded);
    }
    // 7: grow L1 toward the initial/soft targets.
    if total_l1_assigned < ctx.pool.initial_srvs || l1.len() as u32 < ctx.pool.cache_l1_srvs {
        return grow_l1(&ctx, &l2).await;
    }

    Ok(Action::NoActionNeeded)
}
